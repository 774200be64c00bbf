//! End-to-end stage scenarios driven through a scripted command runner.

use alcib::config::BuildConfig;
use alcib::pipeline::{PipelineState, Stage, StageError, StagePipeline};
use alcib::provision::TerraformProvisioner;
use alcib::session::{CommandOutput, SessionError};
use alcib::target::{Architecture, BackendKind, ImageKind};
use alcib::test_support::{
    RecordingRegistry, RegistryCall, ScriptedRunner, StaticSigner, build_config, failure,
    scripted_services, scripted_target, success,
};
use alcib::workspace;
use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

type Pipeline<'a> = StagePipeline<
    'a,
    ScriptedRunner,
    TerraformProvisioner<ScriptedRunner>,
    RecordingRegistry,
    StaticSigner,
>;

const OUTPUTS: &str =
    r#"{"instance_public_ip":{"value":"3.3.3.3"},"instance_id":{"value":"i-1"}}"#;

const BOX_SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 temp dir");
        Self { _tmp: tmp, root }
    }

    fn config(&self, image: &str) -> BuildConfig {
        build_config(&self.root, image)
    }
}

fn runner() -> ScriptedRunner {
    let runner = ScriptedRunner::permissive();
    runner.respond_to("output -json", success(OUTPUTS));
    runner
}

fn pipeline<'a>(
    config: &'a BuildConfig,
    runner: &ScriptedRunner,
    backend: BackendKind,
    arch: Architecture,
    registry: RecordingRegistry,
) -> Pipeline<'a> {
    let target = scripted_target(backend, arch, config, runner).expect("supported target");
    let services = scripted_services(runner, config, registry).expect("services");
    let image = config.image_kind().expect("valid image");
    StagePipeline::new(config, image, target, services, "20211020")
}

fn kvm<'a>(config: &'a BuildConfig, runner: &ScriptedRunner) -> Pipeline<'a> {
    pipeline(
        config,
        runner,
        BackendKind::Kvm,
        Architecture::X86_64,
        RecordingRegistry::with_probe_status(200),
    )
}

fn exit_with(code: i32) -> CommandOutput {
    if code == 0 { success("") } else { failure(code, "simulated failure") }
}

#[rstest]
#[case(0)]
#[case(1)]
#[tokio::test]
async fn build_log_is_uploaded_whatever_the_build_exit(#[case] code: i32) {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    runner.respond_to("packer build", exit_with(code));
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Build);

    let result = pipeline.run(Stage::Build).await;

    assert_eq!(
        runner.count_matching("sha256sum Vagrant_Box_x86_64_build*.log"),
        1
    );
    assert_eq!(runner.count_matching("sha256sum *.box"), 1);
    if code == 0 {
        assert_eq!(result, Ok(PipelineState::Built));
    } else {
        assert!(
            matches!(result, Err(StageError::Session(SessionError::Execute { .. }))),
            "unexpected result: {result:?}"
        );
        assert_eq!(pipeline.state(), PipelineState::Provisioned);
    }
    assert_eq!(runner.count_matching("-O exit"), 1, "session closed once");
}

#[rstest]
#[case(404, 1)]
#[case(200, 0)]
#[tokio::test]
async fn box_release_creates_the_version_only_when_missing(
    #[case] probe_status: u16,
    #[case] expected_creates: usize,
) {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    runner.respond_to(
        "sha256sum *.box",
        success(format!("{BOX_SUM}  almalinux-8-libvirt.box\n")),
    );
    let mut pipeline = pipeline(
        &config,
        &runner,
        BackendKind::Kvm,
        Architecture::X86_64,
        RecordingRegistry::with_probe_status(probe_status),
    )
    .resume_at(Stage::Release);

    pipeline.run(Stage::Release).await.expect("release succeeds");

    let calls = pipeline.services().registry.calls();
    let creates = calls
        .iter()
        .filter(|call| matches!(call, RegistryCall::CreateVersion { .. }))
        .count();
    assert_eq!(creates, expected_creates);
    let provider_at = calls
        .iter()
        .position(|call| matches!(call, RegistryCall::CreateProvider { .. }))
        .expect("provider registered");
    if let Some(create_at) = calls
        .iter()
        .position(|call| matches!(call, RegistryCall::CreateVersion { .. }))
    {
        assert!(create_at < provider_at, "version created before provider");
    }
    assert!(calls.contains(&RegistryCall::CreateProvider {
        version: String::from("8.5.20211020"),
        provider: String::from("libvirt"),
        checksum: String::from(BOX_SUM),
    }));

    let upload = runner.invocations_matching("curl --fail");
    assert_eq!(upload.len(), 1);
    let line = upload.first().expect("upload invocation").last_arg();
    assert!(line.contains("almalinux-8-libvirt.box"), "{line}");
    assert!(
        line.contains(pipeline.services().registry.upload_target()),
        "{line}"
    );
}

#[rstest]
#[case(0)]
#[case(1)]
#[tokio::test]
async fn test_teardown_runs_whatever_the_harness_exit(#[case] code: i32) {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    runner.respond_to("py.test", exit_with(code));
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Test);

    let result = pipeline.run(Stage::Test).await;

    assert_eq!(runner.count_matching("vagrant destroy -f"), 1);
    assert_eq!(runner.count_matching("sha256sum vagrant_box_test*.log"), 1);
    assert_eq!(result.is_ok(), code == 0, "unexpected result: {result:?}");
    let harness_at = runner.position_of("py.test").expect("harness ran");
    let teardown_at = runner.position_of("vagrant destroy -f").expect("teardown ran");
    assert!(harness_at < teardown_at);
}

#[tokio::test]
async fn openstack_instances_are_torn_down_after_a_readiness_timeout() {
    let ws = Workspace::new();
    let clouds = ws.root.join("clouds.yaml");
    workspace::write_file(&clouds, "clouds: {}\n").expect("clouds.yaml");
    let config = BuildConfig {
        openstack_clouds_file: Some(clouds.into_string()),
        ..ws.config("Generic Cloud")
    };
    let runner = runner();
    runner.respond_to("ssh -F", failure(255, "Connection refused"));
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Test);

    let err = pipeline.run(Stage::Test).await.expect_err("instances never ready");

    assert!(
        matches!(err, StageError::Timeout { attempts: 2, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(runner.count_matching("ssh -F"), 2);
    assert_eq!(runner.count_matching("py.test"), 0);

    let suite = "/home/ec2-user/cloud-images/tests/genericcloud";
    let step = |fragment: String| runner.position_of(&fragment).expect(&fragment);
    let upload_apply = step(format!("cd {suite}/upload_image/amd64 && terraform init"));
    let launch_apply = step(format!("cd {suite}/launch_test_instances/amd64 && terraform init"));
    let readiness = step(String::from("ssh -F"));
    let launch_destroy = step(format!(
        "cd {suite}/launch_test_instances/amd64 && terraform destroy"
    ));
    let upload_destroy = step(format!("cd {suite}/upload_image/amd64 && terraform destroy"));
    assert!(upload_apply < launch_apply, "image uploaded before instances launch");
    assert!(launch_apply < readiness);
    assert!(readiness < launch_destroy);
    assert!(launch_destroy < upload_destroy, "teardown runs in reverse order");

    assert_eq!(runner.count_matching("sha256sum genericcloud_test*.log"), 1);
    assert_eq!(runner.count_matching("-O exit"), 1, "session closed once");
    assert_eq!(pipeline.state(), PipelineState::Built);
}

#[tokio::test]
async fn init_skips_apply_when_the_handle_is_cached() {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    let mut pipeline = kvm(&config, &runner);
    pipeline.target().resolve_handle().expect("handle");

    let state = pipeline.run(Stage::Init).await.expect("init succeeds");

    assert_eq!(state, PipelineState::Provisioned);
    assert_eq!(runner.count_matching("apply -auto-approve"), 0);
    assert_eq!(runner.count_matching("output -json"), 1);
    assert_eq!(runner.count_matching("ansible-playbook"), 1);
    let hosts = workspace::read_file(&ws.root.join("ansible/hosts")).expect("hosts written");
    assert_eq!(hosts, "[aws_instance_public_ip]\n3.3.3.3\n");
}

#[tokio::test]
async fn init_provisions_a_fresh_target_once() {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    let mut pipeline = kvm(&config, &runner);

    pipeline.run(Stage::Init).await.expect("init succeeds");

    assert_eq!(runner.count_matching("apply -auto-approve"), 1);
    let apply_at = runner.position_of("apply -auto-approve").expect("apply");
    let probe_at = runner.position_of("exit 0").expect("ssh probe");
    assert!(apply_at < probe_at, "instance exists before the ssh wait");
}

#[tokio::test]
async fn init_times_out_when_ssh_never_answers() {
    let ws = Workspace::new();
    let config = ws.config("Vagrant Box");
    let runner = runner();
    runner.respond_to("ControlMaster=yes", failure(255, "Connection refused"));
    let mut pipeline = kvm(&config, &runner);

    let err = pipeline.run(Stage::Init).await.expect_err("ssh never ready");

    assert!(
        matches!(err, StageError::Timeout { attempts: 2, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(runner.count_matching("ansible-playbook"), 0);
}

#[tokio::test]
async fn disk_release_stages_signs_and_publishes_in_order() {
    let ws = Workspace::new();
    let config = ws.config("Generic Cloud");
    let runner = runner();
    runner.respond_to(
        "s3 ls",
        success(
            "2021-10-20 10:00:00       4096 Generic_Cloud_x86_64_build_20211020.log\n\
             2021-10-20 10:05:00  512000000 almalinux-8-GenericCloud-8.5.x86_64.qcow2\n",
        ),
    );
    let manifest = format!("{BOX_SUM}  images/AlmaLinux-8-GenericCloud-8.5-20211020.x86_64.qcow2\n");
    runner.respond_to("cat CHECKSUM", success(manifest.clone()));
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Release);

    let state = pipeline.run(Stage::Release).await.expect("release succeeds");

    assert_eq!(state, PipelineState::Released);
    assert_eq!(
        runner.count_matching(
            "s3 cp s3://alcib-artifacts/42-Generic_Cloud-kvm-x86_64-20211020/almalinux-8-GenericCloud-8.5.x86_64.qcow2"
        ),
        1
    );
    let order = [
        "s3 ls",
        "mkdir -p /var/ftp/pub/almalinux/8/cloud/x86_64/images",
        "x86_64/images/AlmaLinux-8-GenericCloud-8.5-20211020.x86_64.qcow2",
        "ln -sf images/AlmaLinux-8-GenericCloud-8.5-20211020.x86_64.qcow2 AlmaLinux-8-GenericCloud-latest.x86_64.qcow2",
        "cat CHECKSUM",
        "x86_64/CHECKSUM.asc",
        "rsync --dry-run -avSHP",
        "rsync -avSHP",
        "systemctl start --no-block rsync-repo-alma",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|fragment| runner.position_of(fragment).expect(fragment))
        .collect();
    assert!(
        positions.windows(2).all(|pair| pair.first() < pair.last()),
        "hops out of order: {positions:?}"
    );
    assert_eq!(pipeline.services().signer.manifests(), vec![manifest]);
    assert!(
        runner
            .invocations_matching("rsync -avSHP")
            .iter()
            .all(|call| call.last_arg().contains("deploy-repo-alma@deploy.example.test:/repo/almalinux/8/cloud/"))
    );
    let notify = runner.invocations_matching("systemctl start");
    assert_eq!(notify.len(), 1);
    assert!(
        notify
            .first()
            .is_some_and(|call| call.command_string().contains("deploy-repo-alma@deploy.example.test")),
        "systemctl runs on the deploy host"
    );
    let staging = ws.root.join("42-Generic_Cloud-kvm-x86_64-20211020");
    assert!(!workspace::exists(&staging).expect("stat"), "staging removed");
}

#[tokio::test]
async fn disk_release_without_an_image_never_reaches_the_release_host() {
    let ws = Workspace::new();
    let config = ws.config("Generic Cloud");
    let runner = runner();
    runner.respond_to("s3 ls", success(""));
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Release);

    let err = pipeline.run(Stage::Release).await.expect_err("nothing to release");

    assert_eq!(
        err,
        StageError::MissingArtifact {
            prefix: String::from("42-Generic_Cloud-kvm-x86_64-20211020"),
            suffix: ".qcow2",
        }
    );
    assert_eq!(runner.count_matching("koji.example.test"), 0);
    assert!(pipeline.services().signer.manifests().is_empty());
}

#[tokio::test]
async fn ami_build_hands_off_to_the_second_stage() {
    let ws = Workspace::new();
    let config = ws.config("AWS AMI");
    let runner = runner();
    runner.respond_to(
        "packer build",
        success("==> Builds finished.\n--> qemu: AMIs were created:\nus-east-1: ami-0123456789abcdef0\n"),
    );
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Build);

    pipeline.run(Stage::Build).await.expect("build succeeds");

    let ami = workspace::read_file(&ws.root.join("ami_id_x86_64.txt")).expect("ami id saved");
    assert_eq!(ami, "ami-0123456789abcdef0");
    let tfvars = workspace::read_file(&ws.root.join("terraform/aws-stage-2/terraform.tfvars.json"))
        .expect("tfvars written");
    assert_eq!(tfvars, r#"{"ami_id":"ami-0123456789abcdef0"}"#);
    assert_eq!(
        runner.count_matching("cloud-images/build-tools-on-ec2-userdata.yml"),
        1
    );
    let build = runner.invocations_matching("packer build");
    let line = build.first().expect("build ran").last_arg();
    assert!(line.contains("export AWS_ACCESS_KEY_ID=AKIATEST"), "{line}");
}

#[tokio::test]
async fn ami_release_mirrors_and_collects_the_reports() {
    let ws = Workspace::new();
    let config = ws.config("AWS AMI");
    workspace::write_file(&ws.root.join("ami_id_x86_64.txt"), "ami-0123456789abcdef0\n")
        .expect("ami id");
    let runner = runner();
    runner.respond_to(
        "sha256sum aws_amis*.csv",
        success(format!("{BOX_SUM}  aws_amis-x86_64.csv\n")),
    );
    runner.respond_to(
        "sha256sum AWS_AMIS*.md",
        success(format!("{BOX_SUM}  AWS_AMIS-x86_64.md\n")),
    );
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Release);

    let state = pipeline.run(Stage::Release).await.expect("release succeeds");

    assert_eq!(state, PipelineState::Released);
    let mirror = runner.invocations_matching("aws_ami_mirror.py");
    assert_eq!(mirror.len(), 1);
    let line = mirror.first().expect("mirror ran").last_arg();
    for expected in [
        "export AWS_DEFAULT_REGION=us-east-1",
        "export AWS_ACCESS_KEY_ID=AKIATEST",
        "export AWS_SECRET_ACCESS_KEY=s3cr3t",
        "-a ami-0123456789abcdef0 --csv-output aws_amis-x86_64.csv --md-output AWS_AMIS-x86_64.md",
    ] {
        assert!(line.contains(expected), "{expected} missing from {line}");
    }

    let key = "s3://alcib-artifacts/42-AWS_AMI-kvm-x86_64-20211020/";
    for report in ["aws_amis-x86_64.csv", "AWS_AMIS-x86_64.md"] {
        assert_eq!(
            runner.count_matching(&format!("cloud-images/{report} {key}")),
            1,
            "{report} uploaded"
        );
        let local = ws.root.join(report);
        assert_eq!(
            runner.count_matching(&format!(
                "ec2-user@3.3.3.3:/home/ec2-user/cloud-images/{report} {local}"
            )),
            1,
            "{report} copied locally"
        );
    }
    let mirror_at = runner.position_of("aws_ami_mirror.py").expect("mirror");
    let upload_at = runner.position_of("sha256sum aws_amis*.csv").expect("upload");
    assert!(mirror_at < upload_at, "reports uploaded after the mirror finishes");
}

#[tokio::test]
async fn destroy_removes_a_terraform_instance() {
    let ws = Workspace::new();
    let config = ws.config("Generic Cloud");
    let runner = runner();
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Destroy);

    let state = pipeline.run(Stage::Destroy).await.expect("destroy succeeds");

    assert_eq!(state, PipelineState::Destroyed);
    assert_eq!(runner.count_matching("destroy -auto-approve"), 1);
    assert!(pipeline.run(Stage::Init).await.is_err(), "destroyed is terminal");
}

#[tokio::test]
async fn destroy_scrubs_a_bare_metal_host() {
    let ws = Workspace::new();
    let config = ws.config("Generic Cloud");
    let runner = runner();
    let mut pipeline = pipeline(
        &config,
        &runner,
        BackendKind::Equinix,
        Architecture::Aarch64,
        RecordingRegistry::with_probe_status(200),
    )
    .resume_at(Stage::Destroy);

    pipeline.run(Stage::Destroy).await.expect("destroy succeeds");

    assert_eq!(
        runner.count_matching("sudo rm -rf /root/cloud-images && sudo rm -f /root/.ssh/alcib_rsa4096"),
        1
    );
    assert_eq!(runner.count_matching("root@147.75.1.2"), 3);
    assert_eq!(runner.count_matching("destroy -auto-approve"), 0);
}

#[tokio::test]
async fn opennebula_images_have_no_test_harness() {
    let ws = Workspace::new();
    let config = ws.config("OpenNebula");
    let runner = runner();
    let mut pipeline = kvm(&config, &runner).resume_at(Stage::Test);

    let err = pipeline.run(Stage::Test).await.expect_err("unsupported");

    assert_eq!(
        err,
        StageError::Unsupported {
            stage: Stage::Test,
            image: ImageKind::OpenNebula,
            backend: BackendKind::Kvm,
        }
    );
    assert!(runner.invocations().is_empty());
}
