//! The five-stage lifecycle run against one build target.
//!
//! A [`StagePipeline`] runs exactly one stage per call to
//! [`StagePipeline::run`]. The driver normally runs one stage per process,
//! so [`StagePipeline::resume_at`] places a fresh pipeline in the state the
//! requested stage starts from; only the provisioning tool's state file
//! carries over between processes.
//!
//! Remote failures abort the stage. Two points run regardless of an earlier
//! failure: the build stage's log and artifact upload, and the test stage's
//! log retrieval and test-instance teardown. There the earlier error is kept
//! and returned once the cleanup has run.

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use tracing::{info, warn};

use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::config::BuildConfig;
use crate::connection::{ConnectionFactory, LogicalTarget};
use crate::provision::Provisioner;
use crate::session::{CommandRunner, RemoteSession, ShellDialect, powershell_quote};
use crate::signing::ManifestSigner;
use crate::target::{BuildTarget, ImageKind};
use crate::vagrant_cloud::BoxRegistry;

mod build;
mod destroy;
mod error;
mod init;
mod release;
mod state;
mod test_stage;

pub use build::parse_ami_id;
pub use error::StageError;
pub use release::{latest_name, release_name};
pub use state::{PipelineState, Stage};

/// Collaborators a pipeline drives.
#[derive(Debug)]
pub struct PipelineServices<R: CommandRunner + Clone, V, S> {
    /// Runs local tools (bucket CLI, playbook runner).
    pub runner: R,
    /// Opens sessions to the build instance and fixed hosts.
    pub connections: ConnectionFactory<R>,
    /// Box registry used by box releases.
    pub registry: V,
    /// Signs release manifests.
    pub signer: S,
}

/// One target's lifecycle.
#[derive(Debug)]
pub struct StagePipeline<'a, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
{
    config: &'a BuildConfig,
    image: ImageKind,
    target: BuildTarget<P>,
    services: PipelineServices<R, V, S>,
    store: ArtifactStore<R>,
    date: String,
    work_dir: Utf8PathBuf,
    state: PipelineState,
}

impl<'a, R, P, V, S> StagePipeline<'a, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    /// Creates a pipeline for `target` building `image`, dated `date`
    /// (`YYYYMMDD`).
    pub fn new(
        config: &'a BuildConfig,
        image: ImageKind,
        target: BuildTarget<P>,
        services: PipelineServices<R, V, S>,
        date: impl Into<String>,
    ) -> Self {
        let store = ArtifactStore::new(
            config.bucket.as_str(),
            config.aws_bin.as_str(),
            services.runner.clone(),
            config.download_policy(),
        );
        Self {
            config,
            image,
            target,
            services,
            store,
            date: date.into(),
            work_dir: Utf8PathBuf::from(&config.work_dir),
            state: PipelineState::Uninitialized,
        }
    }

    /// Places the pipeline in the state `stage` starts from.
    #[must_use]
    pub fn resume_at(mut self, stage: Stage) -> Self {
        self.state = PipelineState::required_for(stage);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// The target this pipeline drives.
    #[must_use]
    pub const fn target(&self) -> &BuildTarget<P> {
        &self.target
    }

    /// The collaborators this pipeline drives.
    #[must_use]
    pub const fn services(&self) -> &PipelineServices<R, V, S> {
        &self.services
    }

    /// Runs `stage` and returns the state it reached.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::InvalidTransition`] when `stage` cannot run from
    /// the current state, or the stage's own failure. The state is unchanged
    /// on failure.
    pub async fn run(&mut self, stage: Stage) -> Result<PipelineState, StageError> {
        let next = self.state.advance(stage)?;
        info!(
            %stage,
            backend = %self.target.backend(),
            arch = %self.target.arch(),
            image = %self.image,
            "starting stage"
        );
        match stage {
            Stage::Init => self.init().await?,
            Stage::Build => self.build()?,
            Stage::Test => self.test().await?,
            Stage::Release => self.release().await?,
            Stage::Destroy => self.destroy()?,
        }
        info!(%stage, state = %next, "stage finished");
        self.state = next;
        Ok(next)
    }

    fn artifact_key(&self) -> ArtifactKey {
        ArtifactKey {
            build_number: self.config.build_number.clone(),
            image: self.image,
            backend: self.target.backend(),
            arch: self.target.arch(),
            date: self.date.clone(),
        }
    }

    fn build_session(&self) -> Result<RemoteSession<R>, StageError> {
        Ok(self
            .services
            .connections
            .session_for(&self.target, LogicalTarget::BuildInstance)?)
    }

    fn session(&self, logical: LogicalTarget) -> Result<RemoteSession<R>, StageError> {
        Ok(self.services.connections.session_for(&self.target, logical)?)
    }

    const fn unsupported(&self, stage: Stage) -> StageError {
        StageError::Unsupported {
            stage,
            image: self.image,
            backend: self.target.backend(),
        }
    }

    /// Uploads the files matching `patterns` from the build working tree.
    fn upload_outputs(
        &self,
        session: &RemoteSession<R>,
        patterns: &[String],
    ) -> Result<(), StageError> {
        let summary = self.store.upload(
            session,
            self.target.descriptor().working_dir,
            patterns,
            &self.artifact_key(),
        )?;
        info!(
            uploaded = summary.uploaded.len(),
            skipped = summary.skipped.len(),
            "artifact upload finished"
        );
        Ok(())
    }
}

/// Keeps `primary` when it failed, logging the cleanup failure; otherwise
/// surfaces the cleanup failure.
pub(crate) fn preserve<T>(
    primary: Result<T, StageError>,
    cleanup: Result<(), StageError>,
) -> Result<T, StageError> {
    match (primary, cleanup) {
        (Err(err), Err(cleanup_err)) => {
            warn!(error = %cleanup_err, "cleanup failed after an earlier error");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Closes `session` and returns `result`, preferring `result`'s error.
pub(crate) fn finish<T, R: CommandRunner>(
    mut session: RemoteSession<R>,
    result: Result<T, StageError>,
) -> Result<T, StageError> {
    let closed = session.close().map_err(StageError::from);
    preserve(result, closed)
}

/// Quotes `value` for `dialect`.
pub(crate) fn quote(dialect: ShellDialect, value: &str) -> String {
    match dialect {
        ShellDialect::Posix => escape(value.into()).into_owned(),
        ShellDialect::PowerShell => powershell_quote(value),
    }
}

#[cfg(test)]
mod tests;
