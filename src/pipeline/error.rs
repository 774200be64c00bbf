//! Errors raised by pipeline stages.

use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::config::MissingSetting;
use crate::connection::FactoryError;
use crate::session::{SessionError, SpawnError};
use crate::signing::SigningError;
use crate::target::{BackendKind, ImageKind, TargetError};
use crate::vagrant_cloud::RegistryError;
use crate::workspace::WorkspaceError;

use super::{PipelineState, Stage};

/// Why a stage failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StageError {
    /// A remote command, copy, or connection failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Resolving, provisioning, or removing the build instance failed.
    #[error(transparent)]
    Target(#[from] TargetError),
    /// Moving artifacts to or from the bucket failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// A local file could not be read or written.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    /// The box registry refused a request.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The signing service refused a request.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// A setting this stage needs is not configured.
    #[error(transparent)]
    Setting(#[from] MissingSetting),
    /// A local tool could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// A fixed host has no configured address.
    #[error("missing {role} address: set {env_var} or add it to alcib.toml")]
    MissingHost {
        /// Role of the host.
        role: &'static str,
        /// Environment variable that sets it.
        env_var: &'static str,
    },
    /// A readiness wait ran out of attempts.
    #[error("{what} not ready after {attempts} attempts: {last}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Attempts made.
        attempts: u32,
        /// Final failure.
        last: String,
    },
    /// The stage cannot run from the target's current state.
    #[error("cannot run {stage} from state {from}")]
    InvalidTransition {
        /// State the target was in.
        from: PipelineState,
        /// Stage requested.
        stage: Stage,
    },
    /// The stage has no procedure for this image on this backend.
    #[error("{stage} is not supported for {image} images on {backend}")]
    Unsupported {
        /// Stage requested.
        stage: Stage,
        /// Configured image kind.
        image: ImageKind,
        /// Selected backend.
        backend: BackendKind,
    },
    /// An expected artifact is not in the bucket.
    #[error("no object ending in {suffix} under {prefix}")]
    MissingArtifact {
        /// Key prefix searched.
        prefix: String,
        /// File suffix wanted.
        suffix: &'static str,
    },
    /// Tool output could not be interpreted.
    #[error("could not read {what}: {message}")]
    Parse {
        /// What was being read.
        what: &'static str,
        /// Detail.
        message: String,
    },
    /// A local tool exited with a non-zero status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Local {
        /// Program run.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the program.
        stderr: String,
    },
}

impl From<FactoryError> for StageError {
    fn from(value: FactoryError) -> Self {
        match value {
            FactoryError::Session(err) => Self::Session(err),
            FactoryError::Target(err) => Self::Target(err),
            FactoryError::MissingHost { role, env_var } => Self::MissingHost { role, env_var },
        }
    }
}
