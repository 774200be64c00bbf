//! Structured remote commands and their rendering per login shell.
//!
//! Callers describe what to run as a [`RemoteCommand`]: the script text, the
//! dialect it is written in, and environment assignments kept apart from the
//! script. The session renders the final string for the host's login shell,
//! adding the fail-fast preamble and escaping every environment value, so
//! secrets never have to be spliced into script text by hand.

use std::fmt;

use shell_escape::unix::escape;

/// Shell language a script is written in, or a host logs into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShellDialect {
    /// POSIX shell (`bash`) on a Linux host.
    Posix,
    /// PowerShell on a Windows host.
    PowerShell,
}

/// A command to run on a remote host.
#[derive(Clone, Eq, PartialEq)]
pub struct RemoteCommand {
    script: String,
    dialect: ShellDialect,
    env: Vec<(String, String)>,
}

/// Exits with the last native exit code. Windows PowerShell 5.1 ignores
/// `$PSNativeCommandUseErrorActionPreference`, so a failing native command
/// piped into a cmdlet would otherwise leave the script successful.
const POWERSHELL_EXIT_PROPAGATION: &str = "; if ($LASTEXITCODE) { exit $LASTEXITCODE }";

impl RemoteCommand {
    /// Creates a POSIX shell command.
    pub fn posix(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            dialect: ShellDialect::Posix,
            env: Vec::new(),
        }
    }

    /// Creates a PowerShell command.
    pub fn powershell(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            dialect: ShellDialect::PowerShell,
            env: Vec::new(),
        }
    }

    /// Creates a command in the given dialect.
    pub fn in_dialect(dialect: ShellDialect, script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            dialect,
            env: Vec::new(),
        }
    }

    /// Adds an environment assignment visible only to this command.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds every assignment from `pairs`.
    #[must_use]
    pub fn envs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(pairs.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    /// The script exactly as supplied by the caller.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The dialect the script is written in.
    #[must_use]
    pub const fn dialect(&self) -> ShellDialect {
        self.dialect
    }

    /// Renders the string handed to the remote login shell.
    #[must_use]
    pub fn render(&self, login_shell: ShellDialect) -> String {
        match (self.dialect, login_shell) {
            (ShellDialect::Posix, ShellDialect::Posix) => self.render_posix(),
            (ShellDialect::Posix, ShellDialect::PowerShell) => {
                format!("bash -c {}", powershell_quote(&self.render_posix()))
            }
            (ShellDialect::PowerShell, ShellDialect::PowerShell) => self.render_powershell(),
            (ShellDialect::PowerShell, ShellDialect::Posix) => format!(
                "pwsh -NoProfile -Command {}",
                escape(self.render_powershell().into())
            ),
        }
    }

    fn render_posix(&self) -> String {
        let mut rendered = String::from("set -o pipefail; ");
        for (key, value) in &self.env {
            rendered.push_str("export ");
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(escape(value.as_str().into()).as_ref());
            rendered.push_str("; ");
        }
        rendered.push_str(&self.script);
        rendered
    }

    fn render_powershell(&self) -> String {
        let mut rendered = String::from(
            "$ErrorActionPreference = 'Stop'; $PSNativeCommandUseErrorActionPreference = $true; ",
        );
        for (key, value) in &self.env {
            rendered.push_str("$Env:");
            rendered.push_str(key);
            rendered.push_str(" = ");
            rendered.push_str(&powershell_quote(value));
            rendered.push_str("; ");
        }
        rendered.push_str(&self.script);
        rendered.push_str(POWERSHELL_EXIT_PROPAGATION);
        rendered
    }
}

/// Shows the script with environment values masked.
impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, _) in &self.env {
            write!(f, "{key}=*** ")?;
        }
        f.write_str(&self.script)
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("script", &self.script)
            .field("dialect", &self.dialect)
            .field(
                "env",
                &self.env.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Quotes `value` as a single-quoted PowerShell literal.
#[must_use]
pub fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
