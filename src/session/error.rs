//! Errors raised by remote sessions.

use thiserror::Error;

use super::types::SpawnError;

/// Direction of a file copy over a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    /// Local file or inline content to the remote host.
    Upload,
    /// Remote file to the local filesystem.
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
        })
    }
}

/// Errors surfaced while connecting to, executing on, or copying to a host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when SSH configuration is missing a required value.
    #[error("missing {field}: set ALCIB_SSH_{env_suffix} or add {field} to [ssh] in alcib.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Authentication or network setup failed.
    #[error("could not connect to {user}@{host} (status {status_text}): {stderr}")]
    Connect {
        /// Remote host.
        host: String,
        /// Login user.
        user: String,
        /// Exit status of the ssh master process.
        status_text: String,
        /// Stderr captured from ssh.
        stderr: String,
    },
    /// A local helper program could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// A remote command exited with a non-zero status.
    #[error("command `{command}` on {host} exited with status {status_text}: {stderr}")]
    Execute {
        /// Remote host.
        host: String,
        /// Command text as supplied by the caller, environment masked.
        command: String,
        /// Exit code, absent when the channel died.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// A file copy failed.
    #[error("{direction} {source_path} -> {destination} failed (status {status_text}): {stderr}")]
    Transfer {
        /// Copy direction.
        direction: TransferDirection,
        /// Source path.
        source_path: String,
        /// Destination path.
        destination: String,
        /// Exit status of scp.
        status_text: String,
        /// Stderr captured from scp.
        stderr: String,
    },
    /// The session was used after [`close`](super::RemoteSession::close).
    #[error("session to {host} is closed")]
    Closed {
        /// Remote host.
        host: String,
    },
    /// The multiplexing master refused to exit cleanly.
    #[error("closing session to {host} failed: {stderr}")]
    Close {
        /// Remote host.
        host: String,
        /// Stderr captured from `ssh -O exit`.
        stderr: String,
    },
    /// Local scratch files for the session could not be prepared.
    #[error("session scratch space unavailable: {0}")]
    Scratch(String),
}

impl SessionError {
    /// Returns `true` when the error is a remote non-zero exit.
    #[must_use]
    pub const fn is_execute(&self) -> bool {
        matches!(self, Self::Execute { .. })
    }
}
