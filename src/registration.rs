//! Registration orchestrator
//!
//! Drives one node's identity onto the ledger with the disposable `fast`
//! slot and the pushed registration tool, then polls the ledger until the
//! identity shows up or the budget runs out.
//!
//! Whatever happens before polling ends (success, error, timeout or a
//! panic) the tool is killed on the node before `register` returns.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RegistrationConfig;
use crate::error::{FleetError, Result};
use crate::identity::{self, Identity, IdentitySlot};
use crate::ledger::{LedgerClient, RegistrationInfo};
use crate::remote::{shell_path, shell_quote, RunOptions, Session};

/// `pkill` exit status when nothing matched
const PKILL_NO_MATCH: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Registered(RegistrationInfo),
    TimedOut,
}

pub struct Registrar {
    ledger: Arc<dyn LedgerClient>,
    config: RegistrationConfig,
    remote_root: String,
    procs: usize,
}

impl Registrar {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        config: &RegistrationConfig,
        remote_root: &str,
        procs: usize,
    ) -> Self {
        Self {
            ledger,
            config: config.clone(),
            remote_root: remote_root.to_string(),
            procs: procs.max(1),
        }
    }

    fn remote_bundle_path(&self) -> String {
        let file_name = self
            .config
            .bundle_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "register.py".to_string());
        format!("{}/{}", self.config.remote_dir.trim_end_matches('/'), file_name)
    }

    pub fn launch_command(&self) -> String {
        self.config
            .launch_command
            .replace("$BUNDLE", &self.remote_bundle_path())
            .replace("$PROCS", &self.procs.to_string())
    }

    /// Register `identity` from the node behind `session`.
    ///
    /// `TimedOut` is an outcome, not an error: the tool ran for the whole
    /// budget without the identity appearing on the ledger.
    pub async fn register(
        &self,
        session: &dyn Session,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<RegistrationOutcome> {
        let node = session.node().name.clone();
        info!(node = %node, wallet = %identity.wallet, hotkey = %identity.hotkey, "Starting registration");

        let attempt = AssertUnwindSafe(self.attempt(session, identity, timeout))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(FleetError::from_panic(payload)));

        let cleanup = self.kill_tool(session).await;

        match (attempt, cleanup) {
            (Ok(outcome), Ok(())) => {
                match &outcome {
                    RegistrationOutcome::Registered(info) => {
                        info!(node = %node, uid = info.uid, "Registration confirmed")
                    }
                    RegistrationOutcome::TimedOut => {
                        warn!(node = %node, timeout_secs = timeout.as_secs(), "Registration timed out")
                    }
                }
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_error)) => {
                warn!(node = %node, error = %cleanup_error, "Cleanup after failed registration also failed");
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        session: &dyn Session,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<RegistrationOutcome> {
        identity.verify_local()?;
        let address = identity.address()?;

        identity::prepare_slot(session, &self.remote_root, IdentitySlot::Fast).await?;
        identity::write_slot(session, identity, &self.remote_root, IdentitySlot::Fast).await?;
        identity::verify_slot(session, identity, &self.remote_root, IdentitySlot::Fast).await?;

        session
            .run(
                &format!("mkdir -p {}", shell_path(&self.config.remote_dir)),
                RunOptions::default(),
            )
            .await?;
        session
            .put(&self.config.bundle_path, &self.remote_bundle_path())
            .await?;

        self.kill_tool(session).await?;
        session
            .run(&self.launch_command(), RunOptions::default().background())
            .await?;
        debug!(node = %session.node().name, procs = self.procs, "Registration tool launched");

        self.poll(&session.node().name, &address, timeout).await
    }

    async fn poll(&self, node: &str, address: &str, timeout: Duration) -> Result<RegistrationOutcome> {
        let deadline = Instant::now() + timeout;
        let interval = self.config.poll_interval();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RegistrationOutcome::TimedOut);
            }

            match tokio::time::timeout(remaining, self.ledger.lookup(address)).await {
                Ok(Ok(Some(info))) => return Ok(RegistrationOutcome::Registered(info)),
                Ok(Ok(None)) => debug!(node, address, "Not registered yet"),
                Ok(Err(e)) => warn!(node, error = %e, "Ledger lookup failed, still polling"),
                Err(_) => return Ok(RegistrationOutcome::TimedOut),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RegistrationOutcome::TimedOut);
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    /// Kill the registration tool; no matching process is fine
    async fn kill_tool(&self, session: &dyn Session) -> Result<()> {
        let command = format!("pkill -9 -f {}", shell_quote(&self.config.process_pattern));
        let result = session
            .run(&command, RunOptions::default().quiet().allow_failure())
            .await?;

        if result.exit_status == PKILL_NO_MATCH {
            return Ok(());
        }
        result
            .checked(&session.node().name, &command, RunOptions::default())
            .map(|_| ())
    }
}
