//! Authenticated remote sessions over a multiplexed SSH channel.
//!
//! A [`RemoteSession`] starts an SSH control master when it connects, runs
//! every command and copy through that master, and tears it down on
//! [`RemoteSession::close`]. Commands are rendered for the host's login shell
//! with a fail-fast preamble so a failing stage of a pipe fails the whole
//! command.

use std::ffi::OsString;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, error, info, warn};

mod command;
mod config;
mod error;
mod types;
mod util;

pub use command::{RemoteCommand, ShellDialect, powershell_quote};
pub use config::{SshConfig, SshConfigLoadError};
pub use error::{SessionError, TransferDirection};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, SpawnError};
pub use util::expand_tilde;

/// Where and as whom a session logs in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionTarget {
    /// Host name or IP address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Login shell of the user on that host.
    pub shell: ShellDialect,
}

impl SessionTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Lifecycle of a session; a closed session never reconnects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// The control master is running.
    Connected,
    /// [`RemoteSession::close`] has run.
    Closed,
}

/// One authenticated channel to one host.
#[derive(Debug)]
pub struct RemoteSession<R: CommandRunner> {
    target: SessionTarget,
    ssh: SshConfig,
    identity: Utf8PathBuf,
    runner: R,
    control: Option<TempDir>,
}

impl<R: CommandRunner> RemoteSession<R> {
    /// Authenticates against `target` and starts the control master.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] when ssh cannot authenticate or reach
    /// the host, [`SessionError::Spawn`] when ssh cannot be started, and
    /// [`SessionError::Scratch`] when the control socket directory cannot be
    /// created.
    pub fn connect(
        target: SessionTarget,
        ssh: &SshConfig,
        identity: &Utf8Path,
        runner: R,
    ) -> Result<Self, SessionError> {
        let control = tempfile::Builder::new()
            .prefix("alcib-ssh-")
            .tempdir()
            .map_err(|err| SessionError::Scratch(err.to_string()))?;
        let mut session = Self {
            target,
            ssh: ssh.clone(),
            identity: identity.to_path_buf(),
            runner,
            control: None,
        };

        let mut args = session.ssh_options(control.path(), PortFlag::Ssh);
        for option in ["ControlMaster=yes", "ControlPersist=yes"] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from("-f"));
        args.push(OsString::from("-N"));
        args.push(OsString::from(session.target.destination()));

        debug!(host = %session.target.host, user = %session.target.user, "opening ssh control master");
        let output = session.runner.run(&session.ssh.ssh_bin, &args)?;
        if !output.is_success() {
            return Err(SessionError::Connect {
                host: session.target.host.clone(),
                user: session.target.user.clone(),
                status_text: output.status_text(),
                stderr: output.stderr,
            });
        }

        session.control = Some(control);
        Ok(session)
    }

    /// The host this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// The login shell of the remote user.
    #[must_use]
    pub const fn shell(&self) -> ShellDialect {
        self.target.shell
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        if self.control.is_some() {
            SessionState::Connected
        } else {
            SessionState::Closed
        }
    }

    /// Runs `command` and returns its output whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after [`close`](Self::close) and
    /// [`SessionError::Spawn`] when ssh cannot be started.
    pub fn execute(&self, command: &RemoteCommand) -> Result<CommandOutput, SessionError> {
        let control = self.control_path()?;
        let mut args = self.ssh_options(control, PortFlag::Ssh);
        args.push(OsString::from(self.target.destination()));
        args.push(OsString::from(command.render(self.target.shell)));

        info!(host = %self.target.host, command = %command, "executing remote command");
        Ok(self.runner.run(&self.ssh.ssh_bin, &args)?)
    }

    /// Runs `command` and fails on any non-zero exit status.
    ///
    /// On failure stdout is logged at info and stderr at error before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Execute`] carrying the command text, exit
    /// status, and stderr, plus any error from [`execute`](Self::execute).
    pub fn execute_checked(&self, command: &RemoteCommand) -> Result<CommandOutput, SessionError> {
        let output = self.execute(command)?;
        if output.is_success() {
            return Ok(output);
        }

        if !output.stdout.trim().is_empty() {
            info!(host = %self.target.host, "{}", output.stdout.trim_end());
        }
        error!(host = %self.target.host, "{}", output.stderr.trim_end());
        Err(SessionError::Execute {
            host: self.target.host.clone(),
            command: command.to_string(),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    /// Copies a local file to `remote_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transfer`] when scp fails. A partial file may
    /// remain on the host.
    pub fn upload_file(&self, local: &Utf8Path, remote_path: &str) -> Result<(), SessionError> {
        self.copy(
            TransferDirection::Upload,
            local.as_str(),
            &format!("{}:{remote_path}", self.target.destination()),
        )
    }

    /// Writes `content` to `remote_path` through a private scratch file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Scratch`] when the scratch file cannot be
    /// written and [`SessionError::Transfer`] when the copy fails.
    pub fn upload_content(&self, content: &str, remote_path: &str) -> Result<(), SessionError> {
        let mut scratch =
            NamedTempFile::new().map_err(|err| SessionError::Scratch(err.to_string()))?;
        scratch
            .write_all(content.as_bytes())
            .and_then(|()| scratch.flush())
            .map_err(|err| SessionError::Scratch(err.to_string()))?;
        let local = scratch.path().to_string_lossy().into_owned();
        self.copy(
            TransferDirection::Upload,
            &local,
            &format!("{}:{remote_path}", self.target.destination()),
        )
    }

    /// Copies `remote_path` from the host to `local`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transfer`] when scp fails.
    pub fn download(&self, remote_path: &str, local: &Utf8Path) -> Result<(), SessionError> {
        self.copy(
            TransferDirection::Download,
            &format!("{}:{remote_path}", self.target.destination()),
            local.as_str(),
        )
    }

    /// Stops the control master. Every opener calls this exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when called twice and
    /// [`SessionError::Close`] when the master does not exit cleanly. The
    /// session counts as closed either way.
    pub fn close(&mut self) -> Result<(), SessionError> {
        let Some(control) = self.control.take() else {
            return Err(self.closed_error());
        };

        let mut args = self.ssh_options(control.path(), PortFlag::Ssh);
        args.push(OsString::from("-O"));
        args.push(OsString::from("exit"));
        args.push(OsString::from(self.target.destination()));

        debug!(host = %self.target.host, "closing ssh control master");
        let output = self.runner.run(&self.ssh.ssh_bin, &args)?;
        if output.is_success() {
            Ok(())
        } else {
            Err(SessionError::Close {
                host: self.target.host.clone(),
                stderr: output.stderr,
            })
        }
    }

    fn copy(
        &self,
        direction: TransferDirection,
        source: &str,
        destination: &str,
    ) -> Result<(), SessionError> {
        let control = self.control_path()?;
        let mut args = self.ssh_options(control, PortFlag::Scp);
        args.push(OsString::from(source));
        args.push(OsString::from(destination));

        info!(host = %self.target.host, %direction, source, destination, "copying file");
        let output = self.runner.run(&self.ssh.scp_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }

        Err(SessionError::Transfer {
            direction,
            source_path: source.to_owned(),
            destination: destination.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    fn control_path(&self) -> Result<&std::path::Path, SessionError> {
        self.control
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed {
            host: self.target.host.clone(),
        }
    }

    fn ssh_options(&self, control_dir: &std::path::Path, port_flag: PortFlag) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag.as_str()),
            OsString::from(self.ssh.port.to_string()),
            OsString::from("-i"),
            OsString::from(self.identity.as_str()),
        ];

        let mut options = vec![format!(
            "ControlPath={}",
            control_dir.join("cm").to_string_lossy()
        )];
        if self.ssh.batch_mode {
            options.push(String::from("BatchMode=yes"));
        }
        if !self.ssh.strict_host_key_checking {
            options.push(String::from("StrictHostKeyChecking=no"));
        }
        if !self.ssh.known_hosts_file.trim().is_empty() {
            options.push(format!("UserKnownHostsFile={}", self.ssh.known_hosts_file));
        }
        options.push(format!("ConnectTimeout={}", self.ssh.connect_timeout_secs));

        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args
    }
}

impl<R: CommandRunner> Drop for RemoteSession<R> {
    fn drop(&mut self) {
        if self.control.is_none() {
            return;
        }
        warn!(host = %self.target.host, "session dropped without close; stopping control master");
        if let Err(err) = self.close() {
            warn!(host = %self.target.host, error = %err, "control master did not exit cleanly");
        }
    }
}

#[derive(Clone, Copy)]
enum PortFlag {
    Ssh,
    Scp,
}

impl PortFlag {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "-p",
            Self::Scp => "-P",
        }
    }
}
