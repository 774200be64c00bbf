//! `destroy`: tear the build host down, or scrub a host that is kept.

use tracing::info;

use crate::provision::{DestroyOutcome, Provisioner};
use crate::session::{CommandRunner, RemoteCommand};
use crate::signing::ManifestSigner;
use crate::target::ProvisioningMode;
use crate::vagrant_cloud::BoxRegistry;

use super::{StageError, StagePipeline, finish};

impl<R, P, V, S> StagePipeline<'_, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    pub(super) fn destroy(&mut self) -> Result<(), StageError> {
        if self.target.descriptor().provisioning == ProvisioningMode::BareMetal {
            self.scrub_host()?;
        }

        match self.target.deprovision()? {
            DestroyOutcome::Destroyed => {
                info!(backend = %self.target.backend(), "build instance destroyed");
            }
            DestroyOutcome::NothingToDestroy => {
                info!(backend = %self.target.backend(), "nothing to destroy");
            }
        }
        Ok(())
    }

    /// Removes the working tree and uploaded key from a host that outlives
    /// the build.
    fn scrub_host(&self) -> Result<(), StageError> {
        let paths = self.target.paths();
        let command = RemoteCommand::posix(format!(
            "sudo rm -rf {} && sudo rm -f {}",
            paths.working_dir, paths.key_path
        ));
        let session = self.build_session()?;
        let result = session.execute_checked(&command).map(drop).map_err(StageError::from);
        finish(session, result)?;
        info!(host = %self.target.backend(), "bare-metal host scrubbed");
        Ok(())
    }
}
