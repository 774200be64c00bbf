//! Unit tests for the terraform provisioner.

use camino::Utf8Path;
use rstest::rstest;

use super::*;
use crate::test_support::{ScriptedRunner, failure, success};

const DIR: &str = "terraform/kvm";

fn provisioner(runner: &ScriptedRunner) -> TerraformProvisioner<ScriptedRunner> {
    TerraformProvisioner::new("terraform", runner.clone())
}

#[test]
fn apply_runs_init_fmt_validate_apply_in_order() {
    let runner = ScriptedRunner::permissive();

    provisioner(&runner)
        .apply(Utf8Path::new(DIR))
        .expect("apply should succeed");

    let steps: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(
        steps,
        vec![
            "terraform -chdir=terraform/kvm init -input=false",
            "terraform -chdir=terraform/kvm fmt",
            "terraform -chdir=terraform/kvm validate",
            "terraform -chdir=terraform/kvm apply -auto-approve -input=false",
        ]
    );
}

#[test]
fn apply_stops_at_first_failing_step() {
    let runner = ScriptedRunner::permissive();
    runner.respond_to(" validate", failure(1, "Error: Unsupported argument"));

    let err = provisioner(&runner)
        .apply(Utf8Path::new(DIR))
        .expect_err("validate failure aborts apply");

    assert!(matches!(err, ProvisionError::CommandFailure { ref step, .. } if step == "validate"));
    assert_eq!(runner.count_matching(" apply "), 0);
}

#[rstest]
#[case(success("Destroy complete! Resources: 3 destroyed.\n"), DestroyOutcome::Destroyed)]
#[case(
    success("No changes. No objects need to be destroyed.\n"),
    DestroyOutcome::NothingToDestroy
)]
#[case(
    failure(1, "Error: nothing to destroy in state"),
    DestroyOutcome::NothingToDestroy
)]
fn destroy_classifies_outcomes(
    #[case] output: crate::session::CommandOutput,
    #[case] expected: DestroyOutcome,
) {
    let runner = ScriptedRunner::new();
    runner.respond_to("destroy", output);

    let outcome = provisioner(&runner)
        .destroy(Utf8Path::new(DIR))
        .expect("destroy should be tolerated");

    assert_eq!(outcome, expected);
}

#[test]
fn destroy_propagates_other_failures() {
    let runner = ScriptedRunner::new();
    runner.respond_to("destroy", failure(1, "Error: error deleting EC2 instance"));

    let err = provisioner(&runner)
        .destroy(Utf8Path::new(DIR))
        .expect_err("destroy failure must surface");

    assert!(matches!(err, ProvisionError::CommandFailure { ref stderr, .. } if stderr.contains("EC2")));
}

#[test]
fn handle_reads_outputs_json() {
    let runner = ScriptedRunner::new();
    runner.respond_to(
        "output -json",
        success(
            r#"{"instance_id":{"sensitive":false,"type":"string","value":"i-0abc"},
                "instance_public_ip":{"sensitive":false,"type":"string","value":"3.3.3.3"}}"#,
        ),
    );

    let handle = provisioner(&runner)
        .handle(Utf8Path::new(DIR))
        .expect("handle");

    assert_eq!(
        handle,
        ProvisioningHandle {
            address: String::from("3.3.3.3"),
            instance_id: String::from("i-0abc"),
        }
    );
}

#[test]
fn missing_output_is_reported_by_name() {
    let err = parse_handle(Utf8Path::new(DIR), r#"{"instance_id":{"value":"i-0abc"}}"#)
        .expect_err("missing address");

    assert!(err.to_string().contains("instance_public_ip"), "{err}");
}
