//! Test support utilities shared across unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8Path;

use crate::config::BuildConfig;
use crate::connection::{ConnectionFactory, Credential, FixedHosts};
use crate::pipeline::PipelineServices;
use crate::provision::TerraformProvisioner;
use crate::service::ServiceFuture;
use crate::session::{CommandOutput, CommandRunner, SessionError, SpawnError, SshConfig};
use crate::signing::{ManifestSigner, SigningError};
use crate::target::{Architecture, BackendKind, BuildTarget, TargetError};
use crate::vagrant_cloud::{BoxRegistry, RegistryError, VersionProbe};

/// Builds a zero-exit output with the given stdout.
#[must_use]
pub fn success(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

/// Builds a failing output with the given exit code and stderr.
#[must_use]
pub fn failure(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// SSH settings pointing at a fixed identity file.
#[must_use]
pub fn ssh_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        identity_file: Some(String::from("/keys/alcib_rsa4096")),
        private_key: None,
        port: 22,
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
    }
}

/// A complete build configuration rooted at `work_dir`, with every optional
/// host and credential set and retries that never sleep.
#[must_use]
pub fn build_config(work_dir: &Utf8Path, image: &str) -> BuildConfig {
    BuildConfig {
        build_number: String::from("42"),
        image: image.to_owned(),
        bucket: String::from("alcib-artifacts"),
        aws_region: String::from("us-east-1"),
        aws_access_key_id: Some(String::from("AKIATEST")),
        aws_secret_access_key: Some(String::from("s3cr3t")),
        aws_bin: String::from("aws"),
        terraform_bin: String::from("terraform"),
        ansible_playbook_bin: String::from("ansible-playbook"),
        terraform_root: work_dir.join("terraform").into_string(),
        ansible_dir: work_dir.join("ansible").into_string(),
        ansible_playbook: String::from("configure_aws_instance.yml"),
        work_dir: work_dir.as_str().to_owned(),
        cloud_images_repo: String::from("https://github.com/AlmaLinux/cloud-images.git"),
        vagrant_cloud_url: String::from("https://vagrant.example.test/api/v1"),
        vagrant_box: Some(String::from("almalinux/8")),
        vagrant_cloud_token: Some(String::from("vc-token")),
        box_version: Some(String::from("8.5.20211020")),
        box_changelog: Some(String::from("monthly rebuild")),
        release_host: Some(String::from("koji.example.test")),
        release_user: String::from("mockbuild"),
        release_root: String::from("/var/ftp/pub/almalinux/8/cloud"),
        deploy_host: Some(String::from("deploy.example.test")),
        deploy_user: String::from("deploy-repo-alma"),
        deploy_path: String::from("/repo/almalinux/8/cloud/"),
        deploy_service: String::from("rsync-repo-alma"),
        signing_url: Some(String::from("https://sign.example.test/sign")),
        signing_token: Some(String::from("sign-token")),
        bare_metal_host: Some(String::from("147.75.1.2")),
        image_prefix: String::from("AlmaLinux-8"),
        image_version: String::from("8.5"),
        openstack_clouds_file: None,
        windows_smb_user: Some(String::from("smbuser")),
        windows_smb_password: Some(String::from("smbpass")),
        download_attempts: 2,
        download_interval_secs: 0,
        readiness_attempts: 2,
        readiness_interval_secs: 0,
    }
}

/// Target for `backend` on `arch` whose terraform calls go through
/// `runner`.
///
/// # Errors
///
/// Returns [`TargetError`] for unsupported backend and architecture pairs.
pub fn scripted_target(
    backend: BackendKind,
    arch: Architecture,
    config: &BuildConfig,
    runner: &ScriptedRunner,
) -> Result<BuildTarget<TerraformProvisioner<ScriptedRunner>>, TargetError> {
    BuildTarget::new(
        backend,
        arch,
        Utf8Path::new(&config.terraform_root),
        config.bare_metal_host.as_deref(),
        TerraformProvisioner::new(config.terraform_bin.as_str(), runner.clone()),
    )
}

/// Pipeline collaborators wired to `runner`, `registry`, and a
/// [`StaticSigner`].
///
/// # Errors
///
/// Returns [`SessionError`] when the test SSH settings carry no usable key.
pub fn scripted_services<V: BoxRegistry>(
    runner: &ScriptedRunner,
    config: &BuildConfig,
    registry: V,
) -> Result<PipelineServices<ScriptedRunner, V, StaticSigner>, SessionError> {
    let ssh = ssh_config();
    let credential = Credential::from_config(&ssh)?;
    Ok(PipelineServices {
        runner: runner.clone(),
        connections: ConnectionFactory::new(
            ssh,
            credential,
            FixedHosts::from_config(config),
            runner.clone(),
        ),
        registry,
        signer: StaticSigner::default(),
    })
}

/// Scripted command runner used to drive deterministic command outcomes
/// without spawning processes.
///
/// Responses come from three places, checked in order: rules matching a
/// fragment of the rendered command line, a FIFO queue, and finally (for
/// permissive runners) an empty success.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    rules: Rc<RefCell<Vec<Rule>>>,
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
    permissive: Rc<Cell<bool>>,
}

#[derive(Clone, Debug)]
struct Rule {
    fragment: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// The final argument, which for ssh is the rendered remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a strict runner: unscripted invocations fail to spawn.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers unscripted invocations with success.
    #[must_use]
    pub fn permissive() -> Self {
        let runner = Self::default();
        runner.permissive.set(true);
        runner
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns the invocations whose command line contains `fragment`.
    #[must_use]
    pub fn invocations_matching(&self, fragment: &str) -> Vec<CommandInvocation> {
        self.invocations
            .borrow()
            .iter()
            .filter(|invocation| invocation.command_string().contains(fragment))
            .cloned()
            .collect()
    }

    /// Counts the invocations whose command line contains `fragment`.
    #[must_use]
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.invocations_matching(fragment).len()
    }

    /// Position of the first invocation containing `fragment`.
    #[must_use]
    pub fn position_of(&self, fragment: &str) -> Option<usize> {
        self.invocations
            .borrow()
            .iter()
            .position(|invocation| invocation.command_string().contains(fragment))
    }

    /// Answers every invocation containing `fragment` with `output`.
    pub fn respond_to(&self, fragment: impl Into<String>, output: CommandOutput) {
        self.push_rule(fragment.into(), output, None);
    }

    /// Answers the next `times` invocations containing `fragment` with
    /// `output`.
    pub fn respond_times(&self, fragment: impl Into<String>, times: usize, output: CommandOutput) {
        self.push_rule(fragment.into(), output, Some(times));
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn push_rule(&self, fragment: String, output: CommandOutput, remaining: Option<usize>) {
        self.rules.borrow_mut().push(Rule {
            fragment,
            output,
            remaining,
        });
    }

    fn match_rule(&self, command_line: &str) -> Option<CommandOutput> {
        let mut rules = self.rules.borrow_mut();
        let rule = rules.iter_mut().find(|rule| {
            rule.remaining != Some(0) && command_line.contains(rule.fragment.as_str())
        })?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.output.clone())
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let command_line = invocation.command_string();
        self.invocations.borrow_mut().push(invocation);

        if let Some(output) = self.match_rule(&command_line) {
            return Ok(output);
        }
        if let Some(output) = self.responses.borrow_mut().pop_front() {
            return Ok(output);
        }
        if self.permissive.get() {
            return Ok(success(""));
        }
        Err(SpawnError {
            program: program.to_owned(),
            message: String::from("no scripted response available"),
        })
    }
}

/// A call observed by [`RecordingRegistry`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryCall {
    /// Version existence probe.
    Probe {
        /// Version probed.
        version: String,
    },
    /// Version creation.
    CreateVersion {
        /// Version created.
        version: String,
    },
    /// Provider registration.
    CreateProvider {
        /// Version the provider belongs to.
        version: String,
        /// Provider name.
        provider: String,
        /// Declared sha-256 checksum.
        checksum: String,
    },
    /// Upload URL request.
    UploadUrl {
        /// Version the upload belongs to.
        version: String,
        /// Provider name.
        provider: String,
    },
}

/// Box registry fake that records calls and answers the probe with a fixed
/// HTTP status.
#[derive(Clone, Debug)]
pub struct RecordingRegistry {
    probe_status: u16,
    upload_url: String,
    calls: Arc<Mutex<Vec<RegistryCall>>>,
}

impl RecordingRegistry {
    /// Creates a registry whose version probe answers `probe_status`.
    #[must_use]
    pub fn with_probe_status(probe_status: u16) -> Self {
        Self {
            probe_status,
            upload_url: String::from("https://uploads.example.test/box"),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The URL handed out by `upload_url`.
    #[must_use]
    pub fn upload_target(&self) -> &str {
        &self.upload_url
    }

    /// Returns a snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: RegistryCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl BoxRegistry for RecordingRegistry {
    fn probe_version<'a>(&'a self, version: &'a str) -> ServiceFuture<'a, VersionProbe, RegistryError> {
        Box::pin(async move {
            self.record(RegistryCall::Probe {
                version: version.to_owned(),
            });
            Ok(VersionProbe::from_status(self.probe_status))
        })
    }

    fn create_version<'a>(
        &'a self,
        version: &'a str,
        _description: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError> {
        Box::pin(async move {
            self.record(RegistryCall::CreateVersion {
                version: version.to_owned(),
            });
            Ok(())
        })
    }

    fn create_provider<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
        checksum: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError> {
        Box::pin(async move {
            self.record(RegistryCall::CreateProvider {
                version: version.to_owned(),
                provider: provider.to_owned(),
                checksum: checksum.to_owned(),
            });
            Ok(())
        })
    }

    fn upload_url<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
    ) -> ServiceFuture<'a, String, RegistryError> {
        Box::pin(async move {
            self.record(RegistryCall::UploadUrl {
                version: version.to_owned(),
                provider: provider.to_owned(),
            });
            Ok(self.upload_url.clone())
        })
    }
}

/// Signer fake returning a fixed signature and remembering manifests.
#[derive(Clone, Debug, Default)]
pub struct StaticSigner {
    manifests: Arc<Mutex<Vec<String>>>,
}

impl StaticSigner {
    /// Signature text returned for every manifest.
    pub const SIGNATURE: &'static str = "-----BEGIN PGP SIGNATURE-----\nfake\n-----END PGP SIGNATURE-----\n";

    /// Returns the manifests submitted so far.
    #[must_use]
    pub fn manifests(&self) -> Vec<String> {
        self.manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ManifestSigner for StaticSigner {
    fn sign<'a>(&'a self, manifest: &'a str) -> ServiceFuture<'a, String, SigningError> {
        Box::pin(async move {
            self.manifests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(manifest.to_owned());
            Ok(String::from(Self::SIGNATURE))
        })
    }
}
