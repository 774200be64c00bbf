//! `init`: provision, wait for SSH, prepare the host.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tracing::info;

use crate::connection::LogicalTarget;
use crate::provision::Provisioner;
use crate::retry::retry;
use crate::session::{CommandRunner, RemoteCommand};
use crate::signing::ManifestSigner;
use crate::target::{ConfigureMode, ProvisioningMode};
use crate::vagrant_cloud::BoxRegistry;
use crate::workspace;

use super::{StageError, StagePipeline, finish, quote};

/// Inventory group the playbook targets.
const INVENTORY_GROUP: &str = "aws_instance_public_ip";

impl<R, P, V, S> StagePipeline<'_, R, P, V, S>
where
    R: CommandRunner + Clone,
    P: Provisioner,
    V: BoxRegistry,
    S: ManifestSigner,
{
    pub(super) async fn init(&mut self) -> Result<(), StageError> {
        let descriptor = self.target.descriptor();
        if descriptor.provisioning == ProvisioningMode::Terraform
            && self.target.cached_handle().is_none()
        {
            self.target.provision()?;
        } else {
            info!(backend = %self.target.backend(), "instance already provisioned; skipping apply");
        }

        self.wait_for_ssh().await?;

        match descriptor.configure {
            ConfigureMode::Ansible => self.run_playbook(),
            ConfigureMode::GitClone => self.clone_repository(),
            ConfigureMode::None => {
                info!(backend = %self.target.backend(), "no host configuration needed");
                Ok(())
            }
        }
    }

    async fn wait_for_ssh(&self) -> Result<(), StageError> {
        let probe = RemoteCommand::in_dialect(self.target.descriptor().shell, "exit 0");
        let what = format!("ssh on {} build instance", self.target.backend());
        let outcome = retry(
            self.config.readiness_policy(),
            &what,
            |_| -> Result<(), StageError> {
                let session = self.session(LogicalTarget::BuildInstance)?;
                let result = session.execute_checked(&probe).map(drop).map_err(StageError::from);
                finish(session, result)
            },
        )
        .await;
        outcome.map_err(|exhausted| StageError::Timeout {
            what,
            attempts: exhausted.attempts,
            last: exhausted.last.to_string(),
        })?;
        info!(backend = %self.target.backend(), "build instance is ready");
        Ok(())
    }

    fn run_playbook(&self) -> Result<(), StageError> {
        let address = self.target.resolve_handle()?.address.clone();
        let user = self.target.descriptor().login_user;
        let key = self.services.connections.credential().path();
        let ansible_dir = Utf8PathBuf::from(&self.config.ansible_dir);

        workspace::write_file(
            &ansible_dir.join("hosts"),
            &format!("[{INVENTORY_GROUP}]\n{address}\n"),
        )?;
        let inventory_path = ansible_dir.join("inventory.json");
        workspace::write_file(&inventory_path, &inventory(&address, user, key).to_string())?;

        let args = [
            OsString::from("-i"),
            OsString::from(inventory_path.as_str()),
            OsString::from("--private-key"),
            OsString::from(key.as_str()),
            OsString::from("-u"),
            OsString::from(user),
            OsString::from(ansible_dir.join(&self.config.ansible_playbook).as_str()),
        ];
        info!(host = %address, playbook = %self.config.ansible_playbook, "running playbook");
        let output = self
            .services
            .runner
            .run(&self.config.ansible_playbook_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(StageError::Local {
            program: self.config.ansible_playbook_bin.clone(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    fn clone_repository(&self) -> Result<(), StageError> {
        let descriptor = self.target.descriptor();
        let command = RemoteCommand::in_dialect(
            descriptor.shell,
            format!(
                "git clone {} {}",
                quote(descriptor.shell, &self.config.cloud_images_repo),
                quote(descriptor.shell, descriptor.native_working_dir),
            ),
        );
        let session = self.build_session()?;
        let result = session.execute_checked(&command).map(drop).map_err(StageError::from);
        finish(session, result)
    }
}

/// JSON inventory equivalent of the `hosts` file, carrying the login user
/// and key.
fn inventory(address: &str, user: &str, key: &Utf8Path) -> serde_json::Value {
    json!({
        "aws_instance": {
            "hosts": {
                address: {
                    "ansible_user": user,
                    "ansible_ssh_private_key_file": key.as_str(),
                }
            }
        }
    })
}
