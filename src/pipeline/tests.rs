//! Unit tests for the stage state machine and cleanup helpers.

use camino::Utf8Path;
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::provision::TerraformProvisioner;
use crate::session::{SessionError, SessionTarget, SshConfig};
use crate::target::{Architecture, BackendKind};
use crate::test_support::{
    RecordingRegistry, ScriptedRunner, StaticSigner, build_config, failure, scripted_services,
    scripted_target, ssh_config,
};

type TestPipeline<'a> = StagePipeline<
    'a,
    ScriptedRunner,
    TerraformProvisioner<ScriptedRunner>,
    RecordingRegistry,
    StaticSigner,
>;

fn work_dir(tmp: &TempDir) -> &Utf8Path {
    Utf8Path::from_path(tmp.path()).expect("utf-8 temp dir")
}

fn pipeline<'a>(config: &'a BuildConfig, runner: &ScriptedRunner) -> TestPipeline<'a> {
    let target = scripted_target(BackendKind::Kvm, Architecture::X86_64, config, runner)
        .expect("kvm target");
    let services = scripted_services(runner, config, RecordingRegistry::with_probe_status(200))
        .expect("services");
    StagePipeline::new(config, ImageKind::GenericCloud, target, services, "20211020")
}

fn stage_failure() -> StageError {
    StageError::Parse {
        what: "fixture",
        message: String::from("primary"),
    }
}

fn cleanup_failure() -> StageError {
    StageError::Parse {
        what: "fixture",
        message: String::from("cleanup"),
    }
}

#[rstest]
#[case(PipelineState::Uninitialized, Stage::Init, PipelineState::Provisioned)]
#[case(PipelineState::Provisioned, Stage::Build, PipelineState::Built)]
#[case(PipelineState::Built, Stage::Test, PipelineState::Tested)]
#[case(PipelineState::Tested, Stage::Release, PipelineState::Released)]
fn stages_advance_linearly(
    #[case] from: PipelineState,
    #[case] stage: Stage,
    #[case] expected: PipelineState,
) {
    assert_eq!(from.advance(stage), Ok(expected));
}

#[rstest]
#[case(PipelineState::Uninitialized)]
#[case(PipelineState::Provisioned)]
#[case(PipelineState::Built)]
#[case(PipelineState::Tested)]
#[case(PipelineState::Released)]
fn destroy_is_accepted_from_any_live_state(#[case] from: PipelineState) {
    assert_eq!(from.advance(Stage::Destroy), Ok(PipelineState::Destroyed));
}

#[rstest]
#[case(PipelineState::Uninitialized, Stage::Build)]
#[case(PipelineState::Uninitialized, Stage::Release)]
#[case(PipelineState::Provisioned, Stage::Init)]
#[case(PipelineState::Provisioned, Stage::Test)]
#[case(PipelineState::Built, Stage::Release)]
#[case(PipelineState::Released, Stage::Build)]
fn out_of_order_stages_are_rejected(#[case] from: PipelineState, #[case] stage: Stage) {
    assert_eq!(
        from.advance(stage),
        Err(StageError::InvalidTransition { from, stage })
    );
}

#[rstest]
fn destroyed_is_terminal() {
    for stage in Stage::ALL {
        assert!(PipelineState::Destroyed.advance(stage).is_err(), "{stage}");
    }
    assert!(PipelineState::Destroyed.is_terminal());
    assert!(!PipelineState::Released.is_terminal());
}

#[rstest]
#[case("init", Stage::Init)]
#[case("BUILD", Stage::Build)]
#[case(" release ", Stage::Release)]
fn stages_parse_from_cli_spelling(#[case] raw: &str, #[case] expected: Stage) {
    assert_eq!(raw.parse::<Stage>(), Ok(expected));
}

#[test]
fn unknown_stage_lists_choices() {
    let err = "deploy".parse::<Stage>().expect_err("unknown stage");
    let message = err.to_string();
    assert!(message.contains("deploy"), "{message}");
    assert!(message.contains("init, build, test, release, destroy"), "{message}");
}

#[rstest]
#[case(Stage::Init, PipelineState::Uninitialized)]
#[case(Stage::Build, PipelineState::Provisioned)]
#[case(Stage::Test, PipelineState::Built)]
#[case(Stage::Release, PipelineState::Tested)]
#[case(Stage::Destroy, PipelineState::Uninitialized)]
fn resume_at_places_pipeline_before_stage(#[case] stage: Stage, #[case] expected: PipelineState) {
    let tmp = TempDir::new().expect("tempdir");
    let config = build_config(work_dir(&tmp), "generic-cloud");
    let runner = ScriptedRunner::new();

    let resumed = pipeline(&config, &runner).resume_at(stage);

    assert_eq!(resumed.state(), expected);
}

#[tokio::test]
async fn run_refuses_invalid_transition_without_side_effects() {
    let tmp = TempDir::new().expect("tempdir");
    let config = build_config(work_dir(&tmp), "generic-cloud");
    let runner = ScriptedRunner::new();
    let mut fresh = pipeline(&config, &runner);

    let err = fresh.run(Stage::Test).await.expect_err("test before build");

    assert_eq!(
        err,
        StageError::InvalidTransition {
            from: PipelineState::Uninitialized,
            stage: Stage::Test,
        }
    );
    assert_eq!(fresh.state(), PipelineState::Uninitialized);
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[case(Ok(7), Ok(()), Ok(7))]
#[case(Ok(7), Err(cleanup_failure()), Err(cleanup_failure()))]
#[case(Err(stage_failure()), Ok(()), Err(stage_failure()))]
#[case(Err(stage_failure()), Err(cleanup_failure()), Err(stage_failure()))]
fn preserve_prefers_the_earlier_failure(
    #[case] primary: Result<u8, StageError>,
    #[case] cleanup: Result<(), StageError>,
    #[case] expected: Result<u8, StageError>,
) {
    assert_eq!(preserve(primary, cleanup), expected);
}

fn open_session(runner: &ScriptedRunner, ssh: &SshConfig) -> RemoteSession<ScriptedRunner> {
    RemoteSession::connect(
        SessionTarget {
            host: String::from("10.0.0.7"),
            user: String::from("ec2-user"),
            shell: ShellDialect::Posix,
        },
        ssh,
        Utf8Path::new("/keys/alcib_rsa4096"),
        runner.clone(),
    )
    .expect("connect")
}

#[test]
fn finish_closes_the_session_and_keeps_the_stage_error() {
    let runner = ScriptedRunner::permissive();
    runner.respond_to("-O exit", failure(255, "control socket gone"));
    let session = open_session(&runner, &ssh_config());

    let result: Result<(), StageError> = finish(session, Err(stage_failure()));

    assert_eq!(result, Err(stage_failure()));
    assert_eq!(runner.count_matching("-O exit"), 1);
}

#[test]
fn finish_reports_close_failure_after_success() {
    let runner = ScriptedRunner::permissive();
    runner.respond_to("-O exit", failure(255, "control socket gone"));
    let session = open_session(&runner, &ssh_config());

    let err = finish(session, Ok(())).expect_err("close failure surfaces");

    assert!(
        matches!(err, StageError::Session(SessionError::Close { .. })),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[case("==> Builds finished.\nus-east-1: ami-0aaa\n", Some("ami-0aaa"))]
#[case("us-east-1: ami-0old\nus-east-1: ami-0new\n", Some("ami-0new"))]
#[case("eu-west-1: ami-0aaa\n", None)]
#[case("us-east-1:\n", None)]
fn ami_id_comes_from_the_last_region_line(#[case] stdout: &str, #[case] expected: Option<&str>) {
    assert_eq!(parse_ami_id(stdout, "us-east-1").as_deref(), expected);
}

#[test]
fn release_names_follow_the_mirror_layout() {
    assert_eq!(
        release_name("AlmaLinux-8", "GenericCloud", "8.5", "20211020", Architecture::Aarch64),
        "AlmaLinux-8-GenericCloud-8.5-20211020.aarch64.qcow2"
    );
    assert_eq!(
        latest_name("AlmaLinux-8", "OpenNebula", Architecture::X86_64),
        "AlmaLinux-8-OpenNebula-latest.x86_64.qcow2"
    );
}
