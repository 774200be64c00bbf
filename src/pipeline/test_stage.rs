//! `test`: run the image's harness on the build host.
//!
//! Every harness follows one [`TestPlan`]: create scratch directories,
//! upload credentials, prepare, provision test instances, wait for them,
//! run the harness. Log retrieval and teardown then run whatever happened
//! before them.

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::config::required;
use crate::provision::Provisioner;
use crate::retry::retry;
use crate::session::{CommandRunner, RemoteCommand, RemoteSession, ShellDialect};
use crate::signing::ManifestSigner;
use crate::target::{ImageKind, WorkingPaths};
use crate::vagrant_cloud::BoxRegistry;

use super::{Stage, StageError, StagePipeline, finish, preserve};

/// Hosts every harness runs against.
const TEST_HOSTS: [&str; 2] = ["almalinux-test-1", "almalinux-test-2"];

/// Name the built box is registered under for testing.
const TEST_BOX: &str = "almalinux-8-test";

const TF_APPLY: &str = "terraform init -input=false && terraform fmt && terraform validate && terraform apply -auto-approve -input=false";
const TF_DESTROY: &str = "terraform destroy -auto-approve -input=false";

/// A local file copied to the build host before the harness runs.
#[derive(Clone, Debug)]
struct Upload {
    local: Utf8PathBuf,
    remote: String,
}

/// Everything one harness needs, in run order.
#[derive(Debug)]
struct TestPlan {
    log_name: String,
    log_pattern: String,
    local_log: String,
    setup: Vec<RemoteCommand>,
    uploads: Vec<Upload>,
    prepare: Vec<RemoteCommand>,
    provision: Vec<RemoteCommand>,
    readiness: Option<RemoteCommand>,
    harness: RemoteCommand,
    teardown: Vec<RemoteCommand>,
}

impl<R, P, V, S> StagePipeline<'_, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    pub(super) async fn test(&self) -> Result<(), StageError> {
        let plan = match self.image {
            ImageKind::VagrantBox => self.vagrant_plan()?,
            ImageKind::GenericCloud => self.openstack_plan()?,
            ImageKind::AwsAmi => self.ami_plan()?,
            ImageKind::OpenNebula => return Err(self.unsupported(Stage::Test)),
        };

        let session = self.build_session()?;
        let tested = self.run_harness(&session, &plan).await;
        let collected = self.collect_log(&session, &plan);
        let torn_down = tear_down(&session, &plan.teardown);
        let result = preserve(preserve(tested, collected), torn_down);
        finish(session, result)
    }

    async fn run_harness(&self, session: &RemoteSession<R>, plan: &TestPlan) -> Result<(), StageError> {
        for command in &plan.setup {
            session.execute_checked(command)?;
        }
        for upload in &plan.uploads {
            session.upload_file(&upload.local, &upload.remote)?;
        }
        for command in plan.prepare.iter().chain(&plan.provision) {
            session.execute_checked(command)?;
        }

        if let Some(probe) = &plan.readiness {
            let outcome = retry(
                self.config.readiness_policy(),
                "test instances",
                |_| session.execute_checked(probe).map(drop),
            )
            .await;
            outcome.map_err(|exhausted| StageError::Timeout {
                what: String::from("test instances"),
                attempts: exhausted.attempts,
                last: exhausted.last.to_string(),
            })?;
            info!("test instances are ready");
        }

        info!(log = %plan.log_name, "running test harness");
        session.execute_checked(&plan.harness)?;
        info!(image = %self.image, "tests passed");
        Ok(())
    }

    fn collect_log(&self, session: &RemoteSession<R>, plan: &TestPlan) -> Result<(), StageError> {
        let uploaded = self.upload_outputs(session, std::slice::from_ref(&plan.log_pattern));
        let copied = session
            .download(
                &format!(
                    "{}/{}",
                    self.target.descriptor().transfer_root,
                    plan.log_name
                ),
                &self.work_dir.join(&plan.local_log),
            )
            .map_err(StageError::from);
        preserve(uploaded, copied)
    }

    fn vagrant_plan(&self) -> Result<TestPlan, StageError> {
        let log_name = format!("vagrant_box_test_{}.log", self.date);
        let local_log = format!("{}-{log_name}", self.target.backend());
        let hosts = TEST_HOSTS.join(",");
        let descriptor = self.target.descriptor();
        let plan = match descriptor.shell {
            ShellDialect::Posix => {
                let images = descriptor.working_dir;
                let harness = RemoteCommand::posix(format!(
                    "cd {images} && py.test -v --hosts={hosts} --ssh-config=.vagrant/ssh-config {images}/tests/vagrant/test_vagrant.py 2>&1 | tee ./{log_name}"
                ));
                TestPlan {
                    prepare: vec![
                        RemoteCommand::posix(format!(
                            "cd {images} && cp {images}/tests/vagrant/Vagrantfile . && vagrant box add --name {TEST_BOX} *.box && vagrant up"
                        )),
                        RemoteCommand::posix(format!(
                            "cd {images} && vagrant ssh-config > .vagrant/ssh-config"
                        )),
                    ],
                    teardown: vec![RemoteCommand::posix(format!(
                        "cd {images} && vagrant destroy -f && vagrant box remove -f {TEST_BOX}"
                    ))],
                    ..TestPlan::new(log_name, "vagrant_box_test*.log", local_log, harness)
                }
            }
            ShellDialect::PowerShell => {
                let images = descriptor.native_working_dir;
                let smb = [
                    (
                        "SMB_USERNAME",
                        required(self.config.windows_smb_user.as_deref(), "windows_smb_user")?,
                    ),
                    (
                        "SMB_PASSWORD",
                        required(
                            self.config.windows_smb_password.as_deref(),
                            "windows_smb_password",
                        )?,
                    ),
                ];
                let harness = RemoteCommand::powershell(format!(
                    "cd {images}; py.test -v --hosts={hosts} --ssh-config=.vagrant/ssh-config {images}\\tests\\vagrant\\test_vagrant.py | Tee-Object -FilePath {images}\\{log_name}"
                ));
                TestPlan {
                    prepare: vec![
                        RemoteCommand::powershell(format!(
                            "cd {images}; cp {images}\\tests\\vagrant\\Vagrantfile .; vagrant box add --name {TEST_BOX} *.box; vagrant up"
                        ))
                        .envs(smb),
                        RemoteCommand::powershell(format!(
                            "cd {images}; vagrant ssh-config | Out-File -Encoding ascii -FilePath .vagrant/ssh-config"
                        )),
                    ],
                    teardown: vec![RemoteCommand::powershell(format!(
                        "cd {images}; vagrant destroy -f; vagrant box remove -f {TEST_BOX}"
                    ))],
                    ..TestPlan::new(log_name, "vagrant_box_test*.log", local_log, harness)
                }
            }
        };
        Ok(plan)
    }

    fn openstack_plan(&self) -> Result<TestPlan, StageError> {
        let clouds = required(
            self.config.openstack_clouds_file.as_deref(),
            "openstack_clouds_file",
        )?;
        let paths = self.target.paths();
        let images = &paths.working_dir;
        let alias = self.target.arch().descriptor_alias();
        let suite = format!("{images}/tests/genericcloud");
        let upload_dir = format!("{suite}/upload_image/{alias}");
        let launch_dir = format!("{suite}/launch_test_instances/{alias}");
        let log_name = format!("genericcloud_test_{}.log", self.date);
        let hosts = TEST_HOSTS.join(",");
        let harness = RemoteCommand::posix(format!(
            "cd {images} && py.test -v --hosts={hosts} --ssh-config={launch_dir}/ssh-config {launch_dir}/test_genericcloud.py 2>&1 | tee ./{log_name}"
        ));
        let local_log = format!("{}-genericcloud_test_{}.log", self.target.arch(), self.date);

        Ok(TestPlan {
            setup: key_setup(&paths, &[format!("{}/.config/openstack", paths.home)]),
            uploads: vec![
                self.key_upload(&paths),
                Upload {
                    local: Utf8PathBuf::from(clouds),
                    remote: format!("{}/.config/openstack/clouds.yaml", paths.home),
                },
            ],
            prepare: vec![
                key_permissions(&paths),
                RemoteCommand::posix(format!(
                    "mkdir -p {upload_dir} && cp {images}/output-almalinux-8-gencloud-{arch}/*.qcow2 {upload_dir}/",
                    arch = self.target.arch()
                )),
            ],
            provision: vec![
                RemoteCommand::posix(format!("cd {upload_dir} && {TF_APPLY}")),
                RemoteCommand::posix(format!("cd {launch_dir} && {TF_APPLY}")),
            ],
            readiness: Some(readiness_probe(&format!("{launch_dir}/ssh-config"))),
            teardown: vec![
                RemoteCommand::posix(format!("cd {launch_dir} && {TF_DESTROY}")),
                RemoteCommand::posix(format!("cd {upload_dir} && {TF_DESTROY}")),
            ],
            ..TestPlan::new(log_name, "genericcloud_test*.log", local_log, harness)
        })
    }

    fn ami_plan(&self) -> Result<TestPlan, StageError> {
        let aws = self.config.aws_env()?;
        let paths = self.target.paths();
        let images = &paths.working_dir;
        let alias = self.target.arch().descriptor_alias();
        let launch_dir = format!("{images}/tests/ami/launch_test_instances/{alias}");
        let log_name = format!("aws_ami_test_{}.log", self.date);
        let hosts = TEST_HOSTS.join(",");
        let harness = RemoteCommand::posix(format!(
            "cd {images} && py.test -v --hosts={hosts} --ssh-config={launch_dir}/ssh-config {images}/tests/ami/test_ami.py 2>&1 | tee ./{log_name}"
        ));
        let local_log = format!("{}-aws_ami_test_{}.log", self.target.arch(), self.date);

        Ok(TestPlan {
            setup: key_setup(&paths, &[]),
            uploads: vec![self.key_upload(&paths)],
            prepare: vec![key_permissions(&paths)],
            provision: vec![
                RemoteCommand::posix(format!("cd {launch_dir} && {TF_APPLY}")).envs(aws.clone()),
            ],
            readiness: Some(readiness_probe(&format!("{launch_dir}/ssh-config"))),
            teardown: vec![
                RemoteCommand::posix(format!("cd {launch_dir} && {TF_DESTROY}")).envs(aws),
            ],
            ..TestPlan::new(log_name, "aws_ami_test*.log", local_log, harness)
        })
    }

    fn key_upload(&self, paths: &WorkingPaths) -> Upload {
        Upload {
            local: self.services.connections.credential().path().to_path_buf(),
            remote: paths.key_path.clone(),
        }
    }
}

impl TestPlan {
    fn new(log_name: String, log_pattern: &str, local_log: String, harness: RemoteCommand) -> Self {
        Self {
            harness,
            log_name,
            log_pattern: log_pattern.to_owned(),
            local_log,
            setup: Vec::new(),
            uploads: Vec::new(),
            prepare: Vec::new(),
            provision: Vec::new(),
            readiness: None,
            teardown: Vec::new(),
        }
    }
}

/// Runs every teardown command, continuing past failures; returns the first.
fn tear_down<R: CommandRunner>(
    session: &RemoteSession<R>,
    commands: &[RemoteCommand],
) -> Result<(), StageError> {
    let mut first_failure = None;
    for command in commands {
        if let Err(err) = session.execute_checked(command) {
            warn!(error = %err, "test teardown step failed");
            if first_failure.is_none() {
                first_failure = Some(StageError::from(err));
            }
        }
    }
    first_failure.map_or(Ok(()), Err)
}

fn key_setup(paths: &WorkingPaths, extra_dirs: &[String]) -> Vec<RemoteCommand> {
    let mut dirs = vec![format!("{}/.ssh", paths.home)];
    dirs.extend_from_slice(extra_dirs);
    vec![RemoteCommand::posix(format!("mkdir -p {}", dirs.join(" ")))]
}

fn key_permissions(paths: &WorkingPaths) -> RemoteCommand {
    RemoteCommand::posix(format!(
        "chmod 700 {}/.ssh && chmod 600 {}",
        paths.home, paths.key_path
    ))
}

fn readiness_probe(ssh_config: &str) -> RemoteCommand {
    RemoteCommand::posix(
        TEST_HOSTS
            .map(|host| format!("ssh -F {ssh_config} {host} true"))
            .join(" && "),
    )
}
