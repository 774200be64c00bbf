//! SSH client settings loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::SessionError;

/// SSH and SCP settings shared by every session.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "ALCIB_SSH",
    discovery(
        app_name = "alcib",
        env_var = "ALCIB_CONFIG_PATH",
        config_file_name = "alcib.toml",
        dotfile_name = ".alcib.toml",
        project_file_name = "alcib.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Private key file used for every host. Supports tilde expansion.
    pub identity_file: Option<String>,
    /// Inline private key text, used instead of `identity_file` when set.
    pub private_key: Option<String>,
    /// SSH port on every managed host.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking; build instances are ephemeral so
    /// this defaults to off.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds ssh waits for the TCP handshake.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u32,
}

/// Errors raised when loading the SSH configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when a required field is empty
    /// or when neither `identity_file` nor `private_key` is set.
    pub fn validate(&self) -> Result<(), SessionError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        let identity = self.identity_file.as_deref().map(str::trim);
        let inline = self.private_key.as_deref().map(str::trim);
        match (identity, inline) {
            (Some(path), _) if !path.is_empty() => Ok(()),
            (_, Some(key)) if !key.is_empty() => Ok(()),
            _ => Err(SessionError::InvalidConfig {
                field: String::from("identity_file"),
            }),
        }
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("alcib")])
            .map_err(|err| SshConfigLoadError::Parse(err.to_string()))
    }

    fn require_value(value: &str, field: &str) -> Result<(), SessionError> {
        if value.trim().is_empty() {
            return Err(SessionError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}
