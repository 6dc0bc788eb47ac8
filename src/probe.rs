//! Connectivity and state probing
//!
//! Probing never fails as a whole. Each check lands in its own field; a check
//! that errors, or whose prerequisite was not confirmed, leaves that field
//! `Probe::Unknown` and the remaining checks still run.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SoftwareConfig;
use crate::error::Result;
use crate::identity::{self, IdentityFiles, IdentitySlot};
use crate::remote::{shell_path, RunOptions, Session};
use crate::supervisor::Supervisor;

/// Result of a single check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Probe<T> {
    Known(T),
    #[default]
    Unknown,
}

impl<T> Probe<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Probe::Known(value) => Some(value),
            Probe::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Probe::Unknown)
    }

    fn from_check(node: &str, check: &str, result: Result<T>) -> Self {
        match result {
            Ok(value) => Probe::Known(value),
            Err(e) => {
                warn!(node, check, error = %e, "Probe check failed");
                Probe::Unknown
            }
        }
    }
}

impl Probe<bool> {
    /// Confirmed true; unknown counts as not confirmed
    pub fn is_true(&self) -> bool {
        matches!(self, Probe::Known(true))
    }
}

/// Snapshot of one node, rebuilt on every probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub connectivity: bool,
    pub installed: Probe<bool>,
    pub running: Probe<bool>,
    pub branch: Probe<Option<String>>,
    pub identity_files: Probe<IdentityFiles>,
}

impl NodeStatus {
    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// Runs `true`; any transport error or nonzero exit counts as unreachable
pub async fn can_connect(session: &dyn Session) -> bool {
    match session
        .run("true", RunOptions::default().quiet().allow_failure())
        .await
    {
        Ok(result) => result.success(),
        Err(e) => {
            debug!(node = %session.node().name, error = %e, "Connectivity check failed");
            false
        }
    }
}

/// Read-only checks against one node
pub struct StateProber<'a> {
    software: &'a SoftwareConfig,
    supervisor: &'a Supervisor,
    remote_root: &'a str,
}

impl<'a> StateProber<'a> {
    pub fn new(software: &'a SoftwareConfig, supervisor: &'a Supervisor, remote_root: &'a str) -> Self {
        Self {
            software,
            supervisor,
            remote_root,
        }
    }

    /// Identity material in the `default` slot
    pub async fn identity_files(&self, session: &dyn Session) -> Result<IdentityFiles> {
        identity::read_slot(session, self.remote_root, IdentitySlot::Default).await
    }

    pub async fn install_dir_present(&self, session: &dyn Session) -> Result<bool> {
        let result = session
            .run(
                &format!("test -d {}", shell_path(&self.software.install_dir)),
                RunOptions::default().quiet().allow_failure(),
            )
            .await?;
        Ok(result.success())
    }

    /// Branch checked out in the install directory, `None` outside a repo
    pub async fn installed_branch(&self, session: &dyn Session) -> Result<Option<String>> {
        let result = session
            .run(
                &format!(
                    "cd {} && git branch --show-current",
                    shell_path(&self.software.install_dir)
                ),
                RunOptions::default().quiet().allow_failure(),
            )
            .await?;

        let branch = result.stdout.trim();
        Ok((result.success() && !branch.is_empty()).then(|| branch.to_string()))
    }

    pub async fn is_installed(&self, session: &dyn Session) -> Result<bool> {
        let result = session
            .run(
                &self.software.check_command,
                RunOptions::default().quiet().allow_failure(),
            )
            .await?;
        Ok(result.success())
    }

    pub async fn is_running(&self, session: &dyn Session) -> Result<bool> {
        self.supervisor.is_running(session).await
    }

    /// Run every check that its prerequisites allow
    pub async fn probe(&self, session: &dyn Session) -> NodeStatus {
        let node = session.node().name.clone();

        if !can_connect(session).await {
            return NodeStatus::unreachable();
        }

        let identity_files = Probe::from_check(&node, "identity_files", self.identity_files(session).await);

        let branch = match self.install_dir_present(session).await {
            Ok(true) => Probe::from_check(&node, "branch", self.installed_branch(session).await),
            Ok(false) => Probe::Unknown,
            Err(e) => {
                warn!(node = %node, check = "install_dir", error = %e, "Probe check failed");
                Probe::Unknown
            }
        };

        let installed = Probe::from_check(&node, "installed", self.is_installed(session).await);

        let running = if installed.is_true() {
            Probe::from_check(&node, "running", self.is_running(session).await)
        } else {
            Probe::Unknown
        };

        NodeStatus {
            connectivity: true,
            installed,
            running,
            branch,
            identity_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::inventory::test_node;
    use crate::remote::fake::FakeFleet;
    use crate::remote::Transport;

    const ROOT: &str = "/root/.bittensor/wallets";

    fn fixtures() -> (SoftwareConfig, Supervisor) {
        (
            SoftwareConfig::default(),
            Supervisor::new(&SupervisorConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_can_connect() {
        let fleet = FakeFleet::new();
        let host = fleet.add_host("alpha");
        let session = fleet.open(&test_node("alpha")).await.unwrap();
        assert!(can_connect(session.as_ref()).await);

        host.fail_command("true");
        assert!(!can_connect(session.as_ref()).await);
    }

    #[tokio::test]
    async fn test_probe_healthy_node() {
        let (software, supervisor) = fixtures();
        let fleet = FakeFleet::new();
        fleet
            .add_host("alpha")
            .installed(&software.install_dir, "master")
            .with_job("script")
            .with_file(
                &IdentitySlot::Default.operational_key_path(ROOT),
                r#"{"ss58Address": "5Hotalpha"}"#,
            );

        let session = fleet.open(&test_node("alpha")).await.unwrap();
        let status = StateProber::new(&software, &supervisor, ROOT)
            .probe(session.as_ref())
            .await;

        assert!(status.connectivity);
        assert_eq!(status.installed, Probe::Known(true));
        assert_eq!(status.running, Probe::Known(true));
        assert_eq!(status.branch, Probe::Known(Some("master".into())));
        let files = status.identity_files.known().unwrap();
        assert_eq!(files.operational_key.as_deref(), Some("5Hotalpha"));
        assert_eq!(files.custodial_key, None);
    }

    #[tokio::test]
    async fn test_running_skipped_when_not_installed() {
        let (software, supervisor) = fixtures();
        let fleet = FakeFleet::new();
        let host = fleet.add_host("alpha");
        host.with_job("script");

        let session = fleet.open(&test_node("alpha")).await.unwrap();
        let status = StateProber::new(&software, &supervisor, ROOT)
            .probe(session.as_ref())
            .await;

        assert_eq!(status.installed, Probe::Known(false));
        assert!(status.running.is_unknown());
        // No install directory, so no branch lookup either
        assert!(status.branch.is_unknown());
        assert!(!host.commands().iter().any(|c| c.starts_with("pm2 pid")));
        assert!(!host.commands().iter().any(|c| c.contains("git branch")));
    }

    #[tokio::test]
    async fn test_failed_check_leaves_siblings() {
        let (software, supervisor) = fixtures();
        let fleet = FakeFleet::new();
        fleet
            .add_host("alpha")
            .installed(&software.install_dir, "master")
            .fail_command("pm2 pid");

        let session = fleet.open(&test_node("alpha")).await.unwrap();
        let status = StateProber::new(&software, &supervisor, ROOT)
            .probe(session.as_ref())
            .await;

        assert!(status.running.is_unknown());
        assert_eq!(status.installed, Probe::Known(true));
        assert_eq!(status.branch, Probe::Known(Some("master".into())));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_all_unknown() {
        let (software, supervisor) = fixtures();
        let fleet = FakeFleet::new();
        let host = fleet.add_host("alpha");
        let session = fleet.open(&test_node("alpha")).await.unwrap();
        host.fail_command("true");

        let status = StateProber::new(&software, &supervisor, ROOT)
            .probe(session.as_ref())
            .await;
        assert_eq!(status, NodeStatus::unreachable());
    }

    #[tokio::test]
    async fn test_install_dir_with_space_is_quoted() {
        let (mut software, supervisor) = fixtures();
        software.install_dir = "~/miner apps/bittensor".into();
        let fleet = FakeFleet::new();
        let host = fleet.add_host("alpha");
        host.installed(&software.install_dir, "master");

        let session = fleet.open(&test_node("alpha")).await.unwrap();
        let status = StateProber::new(&software, &supervisor, ROOT)
            .probe(session.as_ref())
            .await;

        assert_eq!(status.branch, Probe::Known(Some("master".into())));
        let commands = host.commands();
        assert!(commands.contains(&"test -d ~/'miner apps/bittensor'".to_string()));
        assert!(commands
            .iter()
            .any(|c| c == "cd ~/'miner apps/bittensor' && git branch --show-current"));
    }
}
