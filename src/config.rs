//! Build configuration loaded via `ortho-config`.
//!
//! [`BuildConfig`] is loaded once by the binary and passed by reference to
//! every component. Settings that only one stage needs (release hosts,
//! registry tokens) stay optional here and are demanded with [`required`]
//! when that stage runs.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::target::ImageKind;

/// Settings for one pipeline run, merged from defaults, `alcib.toml`, and
/// `ALCIB_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "ALCIB",
    discovery(
        app_name = "alcib",
        env_var = "ALCIB_CONFIG_PATH",
        config_file_name = "alcib.toml",
        dotfile_name = ".alcib.toml",
        project_file_name = "alcib.toml"
    )
)]
pub struct BuildConfig {
    /// CI build number embedded in artifact keys.
    #[ortho_config(default = String::new())]
    pub build_number: String,
    /// Image kind label, for example `Vagrant Box` or `Generic Cloud`.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// Artifact bucket.
    #[ortho_config(default = String::new())]
    pub bucket: String,
    /// AWS region used by the bucket CLI and AMI builds.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub aws_region: String,
    /// AWS access key forwarded to remote builds that talk to AWS.
    pub aws_access_key_id: Option<String>,
    /// AWS secret key forwarded to remote builds that talk to AWS.
    pub aws_secret_access_key: Option<String>,
    /// Local bucket CLI.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Local provisioning tool.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_bin: String,
    /// Local configuration-management runner.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub ansible_playbook_bin: String,
    /// Directory holding one terraform descriptor per backend.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_root: String,
    /// Directory holding the playbook and the generated inventory.
    #[ortho_config(default = "ansible".to_owned())]
    pub ansible_dir: String,
    /// Playbook run against fresh build instances.
    #[ortho_config(default = "configure_aws_instance.yml".to_owned())]
    pub ansible_playbook: String,
    /// Local directory receiving logs, AMI ids, and downloaded images.
    #[ortho_config(default = ".".to_owned())]
    pub work_dir: String,
    /// Image-definition repository cloned onto hosts without a playbook.
    #[ortho_config(default = "https://github.com/AlmaLinux/cloud-images.git".to_owned())]
    pub cloud_images_repo: String,
    /// Box registry API root.
    #[ortho_config(default = crate::vagrant_cloud::DEFAULT_API_URL.to_owned())]
    pub vagrant_cloud_url: String,
    /// Box name in the registry, `org/name`.
    pub vagrant_box: Option<String>,
    /// Box registry bearer token.
    pub vagrant_cloud_token: Option<String>,
    /// Box version being released.
    pub box_version: Option<String>,
    /// Description attached to a newly created box version.
    pub box_changelog: Option<String>,
    /// Host the released images are published on.
    pub release_host: Option<String>,
    /// Login user on the release host.
    #[ortho_config(default = "mockbuild".to_owned())]
    pub release_user: String,
    /// Publication tree on the release host; one subdirectory per arch.
    #[ortho_config(default = "/var/ftp/pub/cloudlinux/almalinux/8/cloud".to_owned())]
    pub release_root: String,
    /// Host the publication tree is synced to.
    pub deploy_host: Option<String>,
    /// Login user on the deploy host.
    #[ortho_config(default = "deploy-repo-alma".to_owned())]
    pub deploy_user: String,
    /// Destination of the sync on the deploy host.
    #[ortho_config(default = "/repo/almalinux/8/cloud/".to_owned())]
    pub deploy_path: String,
    /// Unit started on the deploy host once the sync finishes.
    #[ortho_config(default = "rsync-repo-alma".to_owned())]
    pub deploy_service: String,
    /// Signing service endpoint.
    pub signing_url: Option<String>,
    /// Signing service bearer token.
    pub signing_token: Option<String>,
    /// Address of the bare-metal build host.
    pub bare_metal_host: Option<String>,
    /// Prefix of released image names.
    #[ortho_config(default = "AlmaLinux-8".to_owned())]
    pub image_prefix: String,
    /// Distribution version in released image names.
    #[ortho_config(default = "8.5".to_owned(), cli_short = 'J')]
    pub image_version: String,
    /// Local `clouds.yaml` uploaded for the OpenStack harness.
    pub openstack_clouds_file: Option<String>,
    /// SMB user the Windows Vagrant harness mounts shares with.
    pub windows_smb_user: Option<String>,
    /// SMB password the Windows Vagrant harness mounts shares with.
    #[ortho_config(cli_short = 'K')]
    pub windows_smb_password: Option<String>,
    /// Attempts per bucket download.
    #[ortho_config(default = 5)]
    pub download_attempts: u32,
    /// Seconds between bucket download attempts.
    #[ortho_config(default = 60)]
    pub download_interval_secs: u64,
    /// Attempts per readiness wait.
    #[ortho_config(default = 30, cli_short = 'Q')]
    pub readiness_attempts: u32,
    /// Seconds between readiness attempts.
    #[ortho_config(default = 10)]
    pub readiness_interval_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

/// A stage-specific setting that was not configured.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("missing {field}: set {env_var} or add {field} to alcib.toml")]
pub struct MissingSetting {
    /// Configuration key.
    pub field: &'static str,
    /// Environment variable that sets it.
    pub env_var: String,
}

/// Returns the trimmed value of an optional setting, or [`MissingSetting`]
/// naming `field` when it is absent or blank.
///
/// # Errors
///
/// Returns [`MissingSetting`] when the value is unset.
pub fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, MissingSetting> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| MissingSetting {
            field,
            env_var: format!("ALCIB_{}", field.to_ascii_uppercase()),
        })
}

impl BuildConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to alcib.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("alcib")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on the settings every stage needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidImage`] when `image` names no known kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in [
            (
                &self.build_number,
                FieldMetadata::new("build number", "ALCIB_BUILD_NUMBER", "build_number"),
            ),
            (
                &self.image,
                FieldMetadata::new("image kind", "ALCIB_IMAGE", "image"),
            ),
            (
                &self.bucket,
                FieldMetadata::new("artifact bucket", "ALCIB_BUCKET", "bucket"),
            ),
            (
                &self.aws_region,
                FieldMetadata::new("AWS region", "ALCIB_AWS_REGION", "aws_region"),
            ),
            (
                &self.terraform_root,
                FieldMetadata::new(
                    "terraform descriptor root",
                    "ALCIB_TERRAFORM_ROOT",
                    "terraform_root",
                ),
            ),
            (
                &self.work_dir,
                FieldMetadata::new("local work directory", "ALCIB_WORK_DIR", "work_dir"),
            ),
        ] {
            Self::require_field(value, &metadata)?;
        }
        self.image_kind()?;
        Ok(())
    }

    /// The configured image kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidImage`] when `image` names no known kind.
    pub fn image_kind(&self) -> Result<ImageKind, ConfigError> {
        self.image
            .parse()
            .map_err(|err: crate::target::ParseKindError| ConfigError::InvalidImage(err.to_string()))
    }

    /// Retry contract for bucket downloads.
    #[must_use]
    pub const fn download_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.download_attempts,
            Duration::from_secs(self.download_interval_secs),
        )
    }

    /// Retry contract for readiness waits.
    #[must_use]
    pub const fn readiness_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.readiness_attempts,
            Duration::from_secs(self.readiness_interval_secs),
        )
    }

    /// AWS variables exported to remote commands that call AWS.
    ///
    /// # Errors
    ///
    /// Returns [`MissingSetting`] when either credential is unset.
    pub fn aws_env(&self) -> Result<Vec<(String, String)>, MissingSetting> {
        let key_id = required(self.aws_access_key_id.as_deref(), "aws_access_key_id")?;
        let secret = required(self.aws_secret_access_key.as_deref(), "aws_secret_access_key")?;
        Ok(vec![
            (String::from("AWS_DEFAULT_REGION"), self.aws_region.clone()),
            (String::from("AWS_ACCESS_KEY_ID"), key_id.to_owned()),
            (String::from("AWS_SECRET_ACCESS_KEY"), secret.to_owned()),
        ])
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// The configured image label names no known kind.
    #[error("invalid image setting: {0}")]
    InvalidImage(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
