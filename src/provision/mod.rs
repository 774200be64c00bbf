//! Terraform-driven provisioning of build instances.
//!
//! Each backend+arch owns one descriptor directory. The [`Provisioner`]
//! trait is the seam between [`crate::target::BuildTarget`] and the tool;
//! [`TerraformProvisioner`] drives the `terraform` CLI with `-chdir` so the
//! process never changes its own working directory.

use std::ffi::OsString;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::session::{CommandOutput, CommandRunner, SpawnError};

/// Phrases terraform prints when a destroy finds no resources.
const NOTHING_TO_DESTROY: [&str; 2] = ["No objects need to be destroyed", "nothing to destroy"];

/// Address and identifier of a running instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisioningHandle {
    /// Public address the instance is reachable on.
    pub address: String,
    /// Provider-assigned instance identifier.
    pub instance_id: String,
}

/// How a destroy request ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DestroyOutcome {
    /// Resources existed and were removed.
    Destroyed,
    /// The tool reported there was nothing to remove.
    NothingToDestroy,
}

/// Errors raised by the provisioning tool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The tool could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// A tool step exited with a non-zero status.
    #[error("terraform {step} in {dir} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Subcommand that failed (`init`, `apply`, ...).
        step: String,
        /// Descriptor directory.
        dir: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the tool.
        stderr: String,
    },
    /// `terraform output -json` could not be interpreted.
    #[error("unreadable terraform outputs in {dir}: {message}")]
    Outputs {
        /// Descriptor directory.
        dir: String,
        /// Parse failure detail.
        message: String,
    },
}

/// Provisioning operations on one descriptor directory.
pub trait Provisioner {
    /// Creates or updates the instance described in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when any step fails.
    fn apply(&self, dir: &Utf8Path) -> Result<(), ProvisionError>;

    /// Removes the instance described in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] unless the destroy succeeded or found
    /// nothing to destroy.
    fn destroy(&self, dir: &Utf8Path) -> Result<DestroyOutcome, ProvisionError>;

    /// Reads the address and identifier of the running instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the query fails or the outputs are
    /// missing.
    fn handle(&self, dir: &Utf8Path) -> Result<ProvisioningHandle, ProvisionError>;
}

/// [`Provisioner`] backed by the `terraform` CLI.
#[derive(Clone, Debug)]
pub struct TerraformProvisioner<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> TerraformProvisioner<R> {
    /// Creates a provisioner invoking `bin` through `runner`.
    pub fn new(bin: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    fn run(&self, dir: &Utf8Path, step: &str, extra: &[&str]) -> Result<CommandOutput, ProvisionError> {
        let mut args = vec![OsString::from(format!("-chdir={dir}")), OsString::from(step)];
        args.extend(extra.iter().map(OsString::from));
        Ok(self.runner.run(&self.bin, &args)?)
    }

    fn run_checked(&self, dir: &Utf8Path, step: &str, extra: &[&str]) -> Result<CommandOutput, ProvisionError> {
        let output = self.run(dir, step, extra)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(failure(dir, step, output))
    }
}

fn failure(dir: &Utf8Path, step: &str, output: CommandOutput) -> ProvisionError {
    ProvisionError::CommandFailure {
        step: step.to_owned(),
        dir: dir.to_string(),
        status_text: output.status_text(),
        stderr: output.stderr,
    }
}

impl<R: CommandRunner> Provisioner for TerraformProvisioner<R> {
    fn apply(&self, dir: &Utf8Path) -> Result<(), ProvisionError> {
        info!(%dir, "applying terraform descriptor");
        self.run_checked(dir, "init", &["-input=false"])?;
        self.run_checked(dir, "fmt", &[])?;
        self.run_checked(dir, "validate", &[])?;
        self.run_checked(dir, "apply", &["-auto-approve", "-input=false"])?;
        Ok(())
    }

    fn destroy(&self, dir: &Utf8Path) -> Result<DestroyOutcome, ProvisionError> {
        info!(%dir, "destroying terraform descriptor");
        let output = self.run(dir, "destroy", &["-auto-approve", "-input=false"])?;
        let reports_nothing = NOTHING_TO_DESTROY
            .iter()
            .any(|phrase| output.stdout.contains(phrase) || output.stderr.contains(phrase));
        if reports_nothing {
            warn!(%dir, "nothing to destroy");
            return Ok(DestroyOutcome::NothingToDestroy);
        }
        if output.is_success() {
            return Ok(DestroyOutcome::Destroyed);
        }
        Err(failure(dir, "destroy", output))
    }

    fn handle(&self, dir: &Utf8Path) -> Result<ProvisioningHandle, ProvisionError> {
        let output = self.run_checked(dir, "output", &["-json"])?;
        parse_handle(dir, &output.stdout)
    }
}

#[derive(Deserialize)]
struct OutputValue {
    value: String,
}

#[derive(Deserialize)]
struct InstanceOutputs {
    instance_public_ip: Option<OutputValue>,
    instance_id: Option<OutputValue>,
}

/// Extracts the instance handle from `terraform output -json` text.
///
/// # Errors
///
/// Returns [`ProvisionError::Outputs`] when the JSON is malformed or either
/// output is absent.
pub fn parse_handle(dir: &Utf8Path, json: &str) -> Result<ProvisioningHandle, ProvisionError> {
    let outputs_error = |message: String| ProvisionError::Outputs {
        dir: dir.to_string(),
        message,
    };
    let outputs: InstanceOutputs =
        serde_json::from_str(json).map_err(|err| outputs_error(err.to_string()))?;
    let address = outputs
        .instance_public_ip
        .ok_or_else(|| outputs_error(String::from("instance_public_ip is not set")))?
        .value;
    let instance_id = outputs
        .instance_id
        .ok_or_else(|| outputs_error(String::from("instance_id is not set")))?
        .value;
    Ok(ProvisioningHandle {
        address,
        instance_id,
    })
}

#[cfg(test)]
mod tests;
