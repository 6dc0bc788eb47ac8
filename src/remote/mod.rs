//! Remote sessions - run commands and push files on a node
//!
//! A `Session` is opened per operation and owned by it exclusively. It must be
//! closed on every exit path; `close()` is idempotent.
//!
//! Every command carries a timeout, either the explicit one in `RunOptions`
//! or the transport's default, so one unreachable node can never stall a
//! batch or a reconciliation cycle.

pub mod ssh;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::inventory::Node;

pub use ssh::SshTransport;

/// Per-command execution options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Don't echo stdout/stderr into the debug log
    pub suppress_output: bool,
    /// Return nonzero exits as a `CommandResult` instead of an error
    pub allow_failure: bool,
    /// Overrides the transport default
    pub timeout: Option<Duration>,
    /// Detach; the command may still be running when `run` returns
    pub background: bool,
}

impl RunOptions {
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.suppress_output = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// Outcome of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Apply the `allow_failure` contract
    pub fn checked(self, node: &str, command: &str, opts: RunOptions) -> Result<Self> {
        if self.success() || opts.allow_failure {
            return Ok(self);
        }
        Err(FleetError::RemoteCommand {
            node: node.to_string(),
            command: command.to_string(),
            status: self.exit_status,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// An open connection to one node
#[async_trait]
pub trait Session: Send + Sync {
    fn node(&self) -> &Node;

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandResult>;

    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    async fn close(&self);
}

/// Opens sessions against nodes
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, node: &Node) -> Result<Box<dyn Session>>;
}

/// Quote a string for POSIX sh
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quote a remote path, keeping a leading `~/` unquoted so it still expands
pub fn shell_path(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}
