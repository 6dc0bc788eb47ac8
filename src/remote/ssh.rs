//! OpenSSH-backed transport
//!
//! Each session starts a control master (`ssh -fNM`) and multiplexes every
//! command and `scp` transfer over its control socket. Closing the session
//! asks the master to exit; if a session is dropped without `close()` the
//! exit request is still fired from `Drop`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{shell_quote, CommandResult, RunOptions, Session, Transport};
use crate::config::SshConfig;
use crate::error::{FleetError, Result};
use crate::inventory::Node;

/// Exit status ssh uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct SshTransport {
    connect_timeout: Duration,
    command_timeout: Duration,
    socket_dir: PathBuf,
}

impl SshTransport {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            socket_dir: std::env::temp_dir(),
        }
    }

    fn control_path(&self) -> PathBuf {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        self.socket_dir
            .join(format!("fleetwatch-{}-{}.sock", std::process::id(), seq))
    }
}

pub struct SshSession {
    node: Node,
    control_path: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
    closed: AtomicBool,
}

/// Options shared by ssh and scp; `port_flag` differs between the two
fn common_args(node: &Node, control_path: &Path, connect_timeout: Duration, port_flag: &str) -> Vec<String> {
    vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".into(),
        format!("ControlPath={}", control_path.display()),
        "-i".into(),
        node.credentials.key.display().to_string(),
        port_flag.into(),
        node.credentials.port.to_string(),
    ]
}

fn destination(node: &Node) -> String {
    format!("{}@{}", node.credentials.user, node.address)
}

fn exit_args(node: &Node, control_path: &Path) -> Vec<String> {
    vec![
        "-o".into(),
        format!("ControlPath={}", control_path.display()),
        "-O".into(),
        "exit".into(),
        destination(node),
    ]
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, node: &Node) -> Result<Box<dyn Session>> {
        let unreachable = |reason: String| FleetError::Connectivity {
            node: node.name.clone(),
            reason,
        };

        if !node.credentials.key.exists() {
            return Err(unreachable(format!(
                "ssh key {} not found",
                node.credentials.key.display()
            )));
        }

        let control_path = self.control_path();
        let mut cmd = Command::new("ssh");
        cmd.args(common_args(node, &control_path, self.connect_timeout, "-p"))
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-f", "-N"])
            .arg(destination(node))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let budget = self.connect_timeout + Duration::from_secs(5);
        let status = match timeout(budget, cmd.status()).await {
            Err(_) => return Err(unreachable(format!("connect timed out after {:?}", budget))),
            Ok(Err(e)) => return Err(unreachable(format!("cannot spawn ssh: {}", e))),
            Ok(Ok(status)) => status,
        };

        if !status.success() {
            return Err(unreachable(format!(
                "ssh exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        debug!(node = %node.name, address = %node.address, "Session opened");

        Ok(Box::new(SshSession {
            node: node.clone(),
            control_path,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Session for SshSession {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandResult> {
        let remote_command = if opts.background {
            format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(command))
        } else {
            command.to_string()
        };
        let limit = opts.timeout.unwrap_or(self.command_timeout);

        trace!(node = %self.node.name, command = %remote_command, "Running remote command");

        let mut cmd = Command::new("ssh");
        cmd.args(common_args(&self.node, &self.control_path, self.connect_timeout, "-p"))
            .arg(destination(&self.node))
            .arg("--")
            .arg(&remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(limit, cmd.output()).await {
            Err(_) => {
                return Err(FleetError::CommandTimeout {
                    node: self.node.name.clone(),
                    command: command.to_string(),
                    timeout: limit,
                })
            }
            Ok(output) => output?,
        };

        let result = CommandResult {
            exit_status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.exit_status == SSH_ERROR_STATUS {
            return Err(FleetError::Connectivity {
                node: self.node.name.clone(),
                reason: result.stderr.trim().to_string(),
            });
        }

        if !opts.suppress_output {
            debug!(
                node = %self.node.name,
                command,
                status = result.exit_status,
                stdout = %result.stdout.trim(),
                stderr = %result.stderr.trim(),
                "Remote command finished"
            );
        }

        result.checked(&self.node.name, command, opts)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let failed = |reason: String| FleetError::Transfer {
            node: self.node.name.clone(),
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reason,
        };

        let mut cmd = Command::new("scp");
        cmd.args(common_args(&self.node, &self.control_path, self.connect_timeout, "-P"))
            .arg("-p")
            .arg(local)
            .arg(format!("{}:{}", destination(&self.node), remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.command_timeout, cmd.output()).await {
            Err(_) => return Err(failed(format!("timed out after {:?}", self.command_timeout))),
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        debug!(node = %self.node.name, local = %local.display(), remote, "File pushed");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut cmd = Command::new("ssh");
        cmd.args(exit_args(&self.node, &self.control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(CLOSE_TIMEOUT, cmd.status()).await {
            Ok(Ok(_)) => debug!(node = %self.node.name, "Session closed"),
            Ok(Err(e)) => warn!(node = %self.node.name, error = %e, "Failed to close session"),
            Err(_) => warn!(node = %self.node.name, "Timed out closing session"),
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Fire and forget; the master exits on its own once asked.
        let _ = std::process::Command::new("ssh")
            .args(exit_args(&self.node, &self.control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_node;

    #[test]
    fn test_common_args() {
        let node = test_node("alpha");
        let args = common_args(&node, Path::new("/tmp/s.sock"), Duration::from_secs(10), "-p");
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/s.sock".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args[args.len() - 2], "-p");
        assert_eq!(args[args.len() - 1], "22");
    }

    #[test]
    fn test_control_paths_are_unique() {
        let transport = SshTransport::new(&SshConfig::default());
        assert_ne!(transport.control_path(), transport.control_path());
    }

    #[tokio::test]
    async fn test_open_without_key_is_connectivity_error() {
        let transport = SshTransport::new(&SshConfig::default());
        let mut node = test_node("alpha");
        node.credentials.key = PathBuf::from("/definitely/not/here");
        let result = transport.open(&node).await;
        assert!(matches!(result, Err(FleetError::Connectivity { .. })));
    }
}
