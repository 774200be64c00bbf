//! `release`: publish what the build produced.
//!
//! Box images go to the box registry. Disk images are downloaded from the
//! bucket, staged on the release host, signed, and pushed to the deploy
//! host. AMIs are mirrored across regions by a script on the build host.

use camino::Utf8Path;
use tracing::info;

use crate::artifact::parse_checksums;
use crate::config::required;
use crate::connection::LogicalTarget;
use crate::provision::Provisioner;
use crate::session::{CommandRunner, RemoteCommand, RemoteSession};
use crate::signing::ManifestSigner;
use crate::target::{Architecture, ImageKind};
use crate::vagrant_cloud::{BoxRegistry, VersionProbe};
use crate::workspace;

use super::{Stage, StageError, StagePipeline, finish, preserve};

/// Suffix of released disk images.
const DISK_SUFFIX: &str = ".qcow2";

/// Manifest of every image under an architecture's release root.
const MANIFEST: &str = "CHECKSUM";

/// Versioned file name of a released disk image.
///
/// # Examples
///
/// ```
/// use alcib::pipeline::release_name;
/// use alcib::target::Architecture;
///
/// assert_eq!(
///     release_name("AlmaLinux-8", "GenericCloud", "8.5", "20211020", Architecture::X86_64),
///     "AlmaLinux-8-GenericCloud-8.5-20211020.x86_64.qcow2",
/// );
/// ```
#[must_use]
pub fn release_name(
    prefix: &str,
    family: &str,
    version: &str,
    date: &str,
    arch: Architecture,
) -> String {
    format!("{prefix}-{family}-{version}-{date}.{arch}{DISK_SUFFIX}")
}

/// Name of the link that always points at the newest release.
#[must_use]
pub fn latest_name(prefix: &str, family: &str, arch: Architecture) -> String {
    format!("{prefix}-{family}-latest.{arch}{DISK_SUFFIX}")
}

impl<R, P, V, S> StagePipeline<'_, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    pub(super) async fn release(&self) -> Result<(), StageError> {
        match self.image {
            ImageKind::VagrantBox => self.release_box().await,
            ImageKind::GenericCloud | ImageKind::OpenNebula => self.release_disk_image().await,
            ImageKind::AwsAmi => self.publish_ami(),
        }
    }

    async fn release_box(&self) -> Result<(), StageError> {
        let provider = self
            .target
            .descriptor()
            .box_provider
            .ok_or_else(|| self.unsupported(Stage::Release))?;
        let version = required(self.config.box_version.as_deref(), "box_version")?;

        let session = self.build_session()?;
        let result = self.publish_box(&session, version, provider).await;
        finish(session, result)
    }

    async fn publish_box(
        &self,
        session: &RemoteSession<R>,
        version: &str,
        provider: &str,
    ) -> Result<(), StageError> {
        let working_dir = self.target.descriptor().working_dir;
        let listing = session.execute_checked(&RemoteCommand::posix(format!(
            "cd {working_dir} && sha256sum *.box"
        )))?;
        let (checksum, box_file) = parse_checksums(&listing.stdout)
            .first()
            .map(|(sum, file)| ((*sum).to_owned(), (*file).to_owned()))
            .ok_or_else(|| StageError::Parse {
                what: "box checksum",
                message: format!("no checksum line for a box under {working_dir}"),
            })?;

        let registry = &self.services.registry;
        match registry.probe_version(version).await? {
            VersionProbe::Missing => {
                let description = self.config.box_changelog.as_deref().unwrap_or_default();
                registry.create_version(version, description).await?;
                info!(version, "created box version");
            }
            VersionProbe::Present(status) => {
                info!(version, status, "box version already exists");
            }
        }
        registry.create_provider(version, provider, &checksum).await?;
        let upload_url = registry.upload_url(version, provider).await?;

        info!(version, provider, file = %box_file, "uploading box");
        session.execute_checked(
            &RemoteCommand::posix(format!(
                "curl --fail --silent --show-error --request PUT --upload-file {working_dir}/{box_file} \"$ALCIB_UPLOAD_URL\""
            ))
            .env("ALCIB_UPLOAD_URL", upload_url),
        )?;
        info!(version, provider, "box released");
        Ok(())
    }

    async fn release_disk_image(&self) -> Result<(), StageError> {
        let arch = self.target.arch();
        let family = self.image.release_family();
        let file_name = release_name(
            &self.config.image_prefix,
            family,
            &self.config.image_version,
            &self.date,
            arch,
        );
        let local_dir = self.work_dir.join(self.artifact_key().to_string());
        workspace::create_dir_all(&local_dir)?;
        let local_image = local_dir.join(&file_name);

        let staged = self.stage_release(&local_image, &file_name).await;
        let removed = workspace::remove_dir_all(&local_dir).map_err(StageError::from);
        let manifest = preserve(staged, removed)?;

        let signature = self.services.signer.sign(&manifest).await?;
        info!(%arch, family, "manifest signed");

        self.publish_signed(&signature)?;
        self.notify_deploy_host()?;
        info!(%arch, family, file = %file_name, "image released");
        Ok(())
    }

    /// Downloads the image, places it on the release host, and returns the
    /// refreshed checksum manifest.
    async fn stage_release(
        &self,
        local_image: &Utf8Path,
        file_name: &str,
    ) -> Result<String, StageError> {
        let key = self.artifact_key();
        let prefix = key.to_string();
        let object = self
            .store
            .list(&prefix)?
            .into_iter()
            .find(|name| name.ends_with(DISK_SUFFIX))
            .ok_or(StageError::MissingArtifact {
                prefix,
                suffix: DISK_SUFFIX,
            })?;
        self.store.download(&key.object(&object), local_image).await?;

        let session = self.session(LogicalTarget::ReleaseHost)?;
        let result = self.place_on_release_host(&session, local_image, file_name);
        finish(session, result)
    }

    fn place_on_release_host(
        &self,
        session: &RemoteSession<R>,
        local_image: &Utf8Path,
        file_name: &str,
    ) -> Result<String, StageError> {
        let arch_root = self.arch_root();
        let latest = latest_name(
            &self.config.image_prefix,
            self.image.release_family(),
            self.target.arch(),
        );
        session.execute_checked(&RemoteCommand::posix(format!("mkdir -p {arch_root}/images")))?;
        session.upload_file(local_image, &format!("{arch_root}/images/{file_name}"))?;
        session.execute_checked(&RemoteCommand::posix(format!(
            "cd {arch_root} && ln -sf images/{file_name} {latest}"
        )))?;
        let manifest = session.execute_checked(&RemoteCommand::posix(format!(
            "cd {arch_root} && sha256sum *{DISK_SUFFIX} images/*{DISK_SUFFIX} > {MANIFEST} && cat {MANIFEST}"
        )))?;
        Ok(manifest.stdout)
    }

    fn publish_signed(&self, signature: &str) -> Result<(), StageError> {
        let deploy_host = required(self.config.deploy_host.as_deref(), "deploy_host")?;
        let arch_root = self.arch_root();
        let destination = format!(
            "{}@{deploy_host}:{}",
            self.config.deploy_user, self.config.deploy_path
        );

        let session = self.session(LogicalTarget::ReleaseHost)?;
        let result = sync_to_deploy_host(&session, signature, &arch_root, &destination);
        finish(session, result)
    }

    fn notify_deploy_host(&self) -> Result<(), StageError> {
        let session = self.session(LogicalTarget::DeployHost)?;
        let result = session
            .execute_checked(&RemoteCommand::posix(format!(
                "systemctl start --no-block {}",
                self.config.deploy_service
            )))
            .map(drop)
            .map_err(StageError::from);
        finish(session, result)
    }

    fn arch_root(&self) -> String {
        format!("{}/{}", self.config.release_root, self.target.arch())
    }

    fn publish_ami(&self) -> Result<(), StageError> {
        let arch = self.target.arch();
        let ami = workspace::read_file(&self.work_dir.join(format!("ami_id_{arch}.txt")))?
            .trim()
            .to_owned();
        if ami.is_empty() {
            return Err(StageError::Parse {
                what: "AMI id",
                message: format!("ami_id_{arch}.txt is empty"),
            });
        }
        let aws = self.config.aws_env()?;

        let session = self.build_session()?;
        let result = self.mirror_ami(&session, &ami, aws);
        finish(session, result)
    }

    fn mirror_ami(
        &self,
        session: &RemoteSession<R>,
        ami: &str,
        aws: Vec<(String, String)>,
    ) -> Result<(), StageError> {
        let arch = self.target.arch();
        let working_dir = self.target.descriptor().working_dir;
        let csv = format!("aws_amis-{arch}.csv");
        let markdown = format!("AWS_AMIS-{arch}.md");
        info!(%ami, %arch, "mirroring AMI across regions");
        session.execute_checked(
            &RemoteCommand::posix(format!(
                "cd {working_dir} && {working_dir}/bin/aws_ami_mirror.py -a {ami} --csv-output {csv} --md-output {markdown} --verbose"
            ))
            .envs(aws),
        )?;

        self.upload_outputs(
            session,
            &[String::from("aws_amis*.csv"), String::from("AWS_AMIS*.md")],
        )?;
        let transfer_root = self.target.descriptor().transfer_root;
        for name in [&csv, &markdown] {
            session.download(&format!("{transfer_root}/{name}"), &self.work_dir.join(name))?;
        }
        info!(%ami, %arch, "AMI published");
        Ok(())
    }
}

/// Writes the detached signature beside the manifest, then mirrors the
/// architecture root to the deploy host, rehearsing with a dry run first.
fn sync_to_deploy_host<R: CommandRunner>(
    session: &RemoteSession<R>,
    signature: &str,
    arch_root: &str,
    destination: &str,
) -> Result<(), StageError> {
    session.upload_content(signature, &format!("{arch_root}/{MANIFEST}.asc"))?;
    for flags in ["--dry-run -avSHP", "-avSHP"] {
        session.execute_checked(&RemoteCommand::posix(format!(
            "rsync {flags} {arch_root} {destination}"
        )))?;
    }
    Ok(())
}
