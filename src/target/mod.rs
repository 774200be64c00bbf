//! One backend+architecture combination and its build instance.
//!
//! A [`BuildTarget`] pairs a static [`BackendDescriptor`] with the
//! architecture being built, the terraform descriptor directory for that
//! pair, and a lazily resolved [`ProvisioningHandle`]. The handle is memoized
//! for the life of the process: resolving it twice issues at most one
//! provisioning-info query.

use std::cell::OnceCell;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::provision::{DestroyOutcome, ProvisionError, Provisioner, ProvisioningHandle};
use crate::session::{RemoteCommand, ShellDialect, powershell_quote};
use crate::workspace::{self, WorkspaceError};

mod backend;

pub use backend::{
    Architecture, BackendDescriptor, BackendKind, BuildRecipe, ConfigureMode, ImageKind,
    ParseKindError, ProvisioningMode,
};

/// File name of the build key copied onto hosts that need it.
pub const REMOTE_KEY_NAME: &str = "alcib_rsa4096";

/// Errors raised while resolving or changing a build target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TargetError {
    /// The provisioning tool failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// A local descriptor directory could not be prepared or removed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    /// The backend does not build this architecture.
    #[error("backend {backend} does not build {arch} images")]
    UnsupportedArchitecture {
        /// Requested backend.
        backend: BackendKind,
        /// Requested architecture.
        arch: Architecture,
    },
    /// The backend has no build command for this image kind.
    #[error("backend {backend} cannot build {image} images for {arch}")]
    UnsupportedImage {
        /// Requested backend.
        backend: BackendKind,
        /// Requested image kind.
        image: ImageKind,
        /// Requested architecture.
        arch: Architecture,
    },
    /// A bare-metal backend was selected without a host address.
    #[error("missing bare-metal host for {backend}: set ALCIB_BARE_METAL_HOST or add bare_metal_host to alcib.toml")]
    MissingBareMetalHost {
        /// Requested backend.
        backend: BackendKind,
    },
}

/// Remote locations on the build host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkingPaths {
    /// Home directory, POSIX view.
    pub home: String,
    /// Image-definition working tree and log sink, POSIX view.
    pub working_dir: String,
    /// The working tree as seen by the login shell.
    pub native_working_dir: String,
    /// The working tree as addressed by scp.
    pub transfer_root: String,
    /// Where the build key is uploaded.
    pub key_path: String,
}

/// Values substituted into build command templates.
#[derive(Clone, Copy, Debug)]
pub struct BuildVars<'a> {
    /// Log file name the build tees into.
    pub log_name: &'a str,
    /// Bucket the build may stage intermediate files in.
    pub bucket: &'a str,
}

/// One backend+architecture pair and its (possibly absent) build instance.
#[derive(Debug)]
pub struct BuildTarget<P: Provisioner> {
    descriptor: &'static BackendDescriptor,
    arch: Architecture,
    provisioner: P,
    descriptor_dir: Utf8PathBuf,
    template_dir: Option<Utf8PathBuf>,
    fixed_address: Option<String>,
    handle: OnceCell<ProvisioningHandle>,
}

impl<P: Provisioner> BuildTarget<P> {
    /// Creates the target for `backend` on `arch`.
    ///
    /// Descriptors live under `terraform_root`: the native architecture uses
    /// `<root>/<backend>` and other architectures get a generated copy of it
    /// at `<root>/<backend>-<arch>`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::UnsupportedArchitecture`] for unsupported pairs
    /// and [`TargetError::MissingBareMetalHost`] when a bare-metal backend has
    /// no configured address.
    pub fn new(
        backend: BackendKind,
        arch: Architecture,
        terraform_root: &Utf8Path,
        bare_metal_host: Option<&str>,
        provisioner: P,
    ) -> Result<Self, TargetError> {
        let descriptor = backend.descriptor();
        if !descriptor.architectures.contains(&arch) {
            return Err(TargetError::UnsupportedArchitecture { backend, arch });
        }

        let fixed_address = match descriptor.provisioning {
            ProvisioningMode::BareMetal => Some(
                bare_metal_host
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .ok_or(TargetError::MissingBareMetalHost { backend })?
                    .to_owned(),
            ),
            ProvisioningMode::Terraform => None,
        };

        let native = terraform_root.join(backend.as_str());
        let (descriptor_dir, template_dir) = if arch == Architecture::X86_64
            || descriptor.provisioning == ProvisioningMode::BareMetal
        {
            (native, None)
        } else {
            (
                terraform_root.join(format!("{}-{arch}", backend.as_str())),
                Some(native),
            )
        };

        Ok(Self {
            descriptor,
            arch,
            provisioner,
            descriptor_dir,
            template_dir,
            fixed_address,
            handle: OnceCell::new(),
        })
    }

    /// The backend built on.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.descriptor.kind
    }

    /// The architecture built.
    #[must_use]
    pub const fn arch(&self) -> Architecture {
        self.arch
    }

    /// Static facts about the backend.
    #[must_use]
    pub const fn descriptor(&self) -> &'static BackendDescriptor {
        self.descriptor
    }

    /// The terraform descriptor directory for this pair.
    #[must_use]
    pub fn descriptor_dir(&self) -> &Utf8Path {
        &self.descriptor_dir
    }

    /// Whether the descriptor directory is generated from a template.
    #[must_use]
    pub const fn has_generated_descriptor(&self) -> bool {
        self.template_dir.is_some()
    }

    /// Remote locations on the build host.
    #[must_use]
    pub fn paths(&self) -> WorkingPaths {
        let descriptor = self.descriptor;
        WorkingPaths {
            home: descriptor.home.to_owned(),
            working_dir: descriptor.working_dir.to_owned(),
            native_working_dir: descriptor.native_working_dir.to_owned(),
            transfer_root: descriptor.transfer_root.to_owned(),
            key_path: format!("{}/.ssh/{REMOTE_KEY_NAME}", descriptor.home),
        }
    }

    /// The handle if it has been resolved in this process.
    #[must_use]
    pub fn cached_handle(&self) -> Option<&ProvisioningHandle> {
        self.handle.get()
    }

    /// Resolves and memoizes the instance handle.
    ///
    /// Bare-metal targets return their configured address without calling
    /// the provisioner.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Provision`] when the outputs query fails.
    pub fn resolve_handle(&self) -> Result<&ProvisioningHandle, TargetError> {
        if let Some(handle) = self.handle.get() {
            return Ok(handle);
        }

        let resolved = match &self.fixed_address {
            Some(address) => ProvisioningHandle {
                address: address.clone(),
                instance_id: address.clone(),
            },
            None => self.provisioner.handle(&self.descriptor_dir)?,
        };
        info!(
            backend = %self.backend(),
            arch = %self.arch,
            address = %resolved.address,
            instance = %resolved.instance_id,
            "resolved build instance"
        );
        Ok(self.handle.get_or_init(|| resolved))
    }

    /// Creates the build instance. Not idempotent: call at most once per run.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError`] when the descriptor cannot be generated or the
    /// provisioning tool fails.
    pub fn provision(&self) -> Result<(), TargetError> {
        if self.descriptor.provisioning == ProvisioningMode::BareMetal {
            info!(backend = %self.backend(), "bare-metal host is provisioned out of band");
            return Ok(());
        }

        if let Some(template) = &self.template_dir
            && !workspace::exists(&self.descriptor_dir)?
        {
            info!(from = %template, to = %self.descriptor_dir, "generating terraform descriptor");
            workspace::copy_dir_all(template, &self.descriptor_dir)?;
        }
        self.provisioner.apply(&self.descriptor_dir)?;
        Ok(())
    }

    /// Removes the build instance and any generated descriptor, and forgets
    /// the cached handle.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Provision`] unless the tool destroyed the
    /// instance or reported nothing to destroy.
    pub fn deprovision(&mut self) -> Result<DestroyOutcome, TargetError> {
        self.handle.take();
        if self.descriptor.provisioning == ProvisioningMode::BareMetal {
            return Ok(DestroyOutcome::NothingToDestroy);
        }
        if self.template_dir.is_some() && !workspace::exists(&self.descriptor_dir)? {
            return Ok(DestroyOutcome::NothingToDestroy);
        }

        let outcome = self.provisioner.destroy(&self.descriptor_dir)?;
        if self.template_dir.is_some() {
            info!(dir = %self.descriptor_dir, "removing generated terraform descriptor");
            workspace::remove_dir_all(&self.descriptor_dir)?;
        }
        Ok(outcome)
    }

    /// Looks up the build command for `image` on this target.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::UnsupportedImage`] when the backend has no
    /// recipe for the image kind on this architecture.
    pub fn build_command_for(
        &self,
        image: ImageKind,
        vars: BuildVars<'_>,
    ) -> Result<RemoteCommand, TargetError> {
        let recipe = self
            .descriptor
            .recipe(image, self.arch)
            .ok_or(TargetError::UnsupportedImage {
                backend: self.backend(),
                image,
                arch: self.arch,
            })?;
        let script = recipe
            .template
            .replace("{images}", self.descriptor.native_working_dir)
            .replace("{log}", vars.log_name)
            .replace("{arch}", self.arch.as_str())
            .replace("{bucket}", &quote_for(self.descriptor.shell, vars.bucket));
        Ok(RemoteCommand::in_dialect(self.descriptor.shell, script))
    }

    /// Command initialising the image-build tool's plugins.
    #[must_use]
    pub fn packer_init_command(&self) -> RemoteCommand {
        RemoteCommand::in_dialect(
            self.descriptor.shell,
            self.descriptor
                .packer_init
                .replace("{images}", self.descriptor.native_working_dir),
        )
    }
}

fn quote_for(shell: ShellDialect, value: &str) -> String {
    match shell {
        ShellDialect::Posix => escape(value.into()).into_owned(),
        ShellDialect::PowerShell => powershell_quote(value),
    }
}
