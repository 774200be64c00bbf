//! Core library for the `alcib` image build orchestrator.
//!
//! The crate drives VM image builds on remote build hosts through a fixed
//! lifecycle (init → build → test → release → destroy). Each backend is one
//! [`target::BuildTarget`] shaped by a static descriptor; remote work runs
//! over multiplexed SSH sessions, artifacts move through an S3 bucket, and
//! releases go to the box registry or to the signed mirror.

pub mod artifact;
pub mod config;
pub mod connection;
pub mod pipeline;
pub mod provision;
pub mod retry;
pub mod service;
pub mod session;
pub mod signing;
pub mod target;
pub mod test_support;
pub mod vagrant_cloud;
pub mod workspace;

pub use artifact::{ArtifactError, ArtifactKey, ArtifactStore};
pub use config::{BuildConfig, ConfigError};
pub use connection::{ConnectionFactory, Credential, LogicalTarget};
pub use pipeline::{PipelineServices, PipelineState, Stage, StageError, StagePipeline};
pub use retry::{RetryPolicy, retry};
pub use session::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommand, RemoteSession,
    SessionError, SshConfig,
};
pub use signing::{ManifestSigner, SigningClient};
pub use target::{Architecture, BackendKind, BuildTarget, ImageKind};
pub use vagrant_cloud::{BoxRegistry, VagrantCloudClient};
