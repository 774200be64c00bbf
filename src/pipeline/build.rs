//! `build`: run the image build and always upload what it left behind.

use camino::Utf8PathBuf;
use serde_json::json;
use tracing::info;

use crate::provision::Provisioner;
use crate::session::{CommandRunner, RemoteSession};
use crate::signing::ManifestSigner;
use crate::target::{Architecture, BackendKind, BuildVars, ImageKind};
use crate::vagrant_cloud::BoxRegistry;
use crate::workspace;

use super::{StageError, StagePipeline, finish, preserve};

/// Userdata the second AMI stage boots with, produced by the first.
const STAGE2_USERDATA: &str = "build-tools-on-ec2-userdata.yml";

impl<R, P, V, S> StagePipeline<'_, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    pub(super) fn build(&self) -> Result<(), StageError> {
        let log_name = self.build_log_name();
        let session = self.build_session()?;

        let built = self.run_build(&session, &log_name);
        let mut patterns = vec![format!(
            "{}_{}_build*.log",
            self.image.slug(),
            self.target.arch()
        )];
        patterns.extend(self.image.artifact_patterns(self.target.arch()));
        let uploaded = self.upload_outputs(&session, &patterns);

        finish(session, preserve(built, uploaded))
    }

    fn build_log_name(&self) -> String {
        format!(
            "{}_{}_build_{}.log",
            self.image.slug(),
            self.target.arch(),
            self.date
        )
    }

    fn run_build(&self, session: &RemoteSession<R>, log_name: &str) -> Result<(), StageError> {
        session.execute_checked(&self.target.packer_init_command())?;

        let mut command = self.target.build_command_for(
            self.image,
            BuildVars {
                log_name,
                bucket: &self.config.bucket,
            },
        )?;
        if self.image == ImageKind::AwsAmi {
            command = command.envs(self.config.aws_env()?);
        }
        info!(image = %self.image, log = log_name, "running image build");
        let output = session.execute_checked(&command)?;

        let remote_log = format!("{}/{log_name}", self.target.descriptor().transfer_root);
        let local_log = self
            .work_dir
            .join(format!("{}-{log_name}", self.target.backend()));
        session.download(&remote_log, &local_log)?;
        info!(image = %self.image, log = %local_log, "image built");

        if self.image == ImageKind::AwsAmi {
            self.hand_off_ami(session, &output.stdout)?;
        }
        Ok(())
    }

    /// Records the AMI id and, after a first-stage build, prepares the
    /// second stage's descriptor.
    fn hand_off_ami(&self, session: &RemoteSession<R>, stdout: &str) -> Result<(), StageError> {
        let ami = parse_ami_id(stdout, &self.config.aws_region).ok_or_else(|| StageError::Parse {
            what: "AMI id",
            message: format!(
                "no build output line starts with {}",
                self.config.aws_region
            ),
        })?;
        let arch = self.target.arch();
        workspace::write_file(&self.work_dir.join(format!("ami_id_{arch}.txt")), &ami)?;
        info!(%ami, %arch, "AMI built");

        if self.target.backend() == BackendKind::AwsStage2 || arch != Architecture::X86_64 {
            return Ok(());
        }

        let stage2 = Utf8PathBuf::from(&self.config.terraform_root)
            .join(BackendKind::AwsStage2.as_str());
        workspace::write_file(
            &stage2.join("terraform.tfvars.json"),
            &json!({ "ami_id": ami }).to_string(),
        )?;
        session.download(
            &format!(
                "{}/{STAGE2_USERDATA}",
                self.target.descriptor().transfer_root
            ),
            &stage2.join(STAGE2_USERDATA),
        )?;
        info!(dir = %stage2, "prepared second AMI stage");
        Ok(())
    }
}

/// Extracts the AMI id from build output: the text after the last `:` on
/// the last line starting with `region`.
///
/// # Examples
///
/// ```
/// use alcib::pipeline::parse_ami_id;
///
/// let out = "==> Builds finished.\nus-east-1: ami-0123456789abcdef0\n";
/// assert_eq!(parse_ami_id(out, "us-east-1").as_deref(), Some("ami-0123456789abcdef0"));
/// ```
#[must_use]
pub fn parse_ami_id(stdout: &str, region: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .filter(|line| line.starts_with(region))
        .filter_map(|line| line.rsplit(':').next())
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_owned)
}
