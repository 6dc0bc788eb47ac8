//! Reconciliation loop
//!
//! Each cycle prints a fresh fleet report, then walks the nodes one at a
//! time in random order and remediates drift:
//! - not registered: stop the job, run a registration
//! - registered but inactive, or job not running: restage the identity
//!   into the `default` slot and restart the job
//!
//! Cycles run back to back while there are nodes to visit. An empty or
//! failing inventory waits a few seconds before the next cycle.
//! Cancellation is checked between nodes, never in the middle of one.

use futures::FutureExt;
use rand::seq::SliceRandom;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::batch::Cancel;
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::identity::{self, IdentitySlot};
use crate::inventory::Node;
use crate::registration::{Registrar, RegistrationOutcome};
use crate::remote::Session;
use crate::report::{build_report, inspect, FleetReport};

/// Pause before retrying a cycle whose inventory listing failed or was empty
const INVENTORY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Sleep for `INVENTORY_RETRY_DELAY` unless cancelled first
async fn idle(cancel: &Cancel) {
    let mut cancelled = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(INVENTORY_RETRY_DELAY) => {}
        _ = cancelled.cancelled() => {}
    }
}

/// What one node needed this cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Remediation {
    Healthy,
    Unreachable,
    Registered(RegistrationOutcome),
    Restarted,
}

pub struct CycleSummary {
    pub report: FleetReport,
    pub remediations: Vec<(String, Result<Remediation>)>,
}

pub struct Reconciler {
    fleet: Arc<Fleet>,
    registrar: Registrar,
    timeout: Duration,
    /// Nodes visited per cycle; `None` visits all
    limit: Option<usize>,
}

impl Reconciler {
    pub fn new(fleet: Arc<Fleet>, procs: usize, timeout: Duration) -> Self {
        let registrar = Registrar::new(
            fleet.ledger.clone(),
            &fleet.config.registration,
            &fleet.config.identity.remote_root,
            procs,
        );
        Self {
            fleet,
            registrar,
            timeout,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Loop until cancelled
    pub async fn run(&self, cancel: &Cancel) {
        let mut cycles = 0u64;

        while !cancel.is_cancelled() {
            cycles += 1;
            match self.cycle(cancel).await {
                Ok(summary) if summary.report.rows.is_empty() => {
                    warn!(cycle = cycles, "Inventory returned no nodes, waiting");
                    idle(cancel).await;
                }
                Ok(summary) => {
                    let failed = summary.remediations.iter().filter(|(_, r)| r.is_err()).count();
                    info!(cycle = cycles, nodes = summary.remediations.len(), failed, "Cycle complete");
                }
                Err(e) => {
                    warn!(cycle = cycles, error = %e, "Inventory unavailable, retrying cycle");
                    idle(cancel).await;
                }
            }
        }

        info!(cycles, "Reconciliation stopped");
    }

    /// One pass over the fleet
    pub async fn cycle(&self, cancel: &Cancel) -> Result<CycleSummary> {
        let nodes = self.fleet.nodes().await?;

        let report = build_report(&self.fleet, nodes.clone(), cancel).await;
        println!("{}", report.render());

        let mut order = nodes;
        order.shuffle(&mut rand::thread_rng());
        if let Some(limit) = self.limit {
            order.truncate(limit);
        }

        let mut remediations = Vec::with_capacity(order.len());
        for node in order {
            if cancel.is_cancelled() {
                info!("Cancelled, stopping cycle");
                break;
            }

            let result = self.reconcile(&node).await;
            match &result {
                Ok(Remediation::Healthy) => {}
                Ok(remediation) => info!(node = %node.name, ?remediation, "Node remediated"),
                Err(e) if e.is_configuration() => {
                    error!(node = %node.name, error = %e, "Node misconfigured, fix its identity")
                }
                Err(e) => warn!(node = %node.name, error = %e, "Remediation failed"),
            }
            remediations.push((node.name.clone(), result));
        }

        Ok(CycleSummary {
            report,
            remediations,
        })
    }

    /// Probe one node and fix whatever drifted
    pub async fn reconcile(&self, node: &Node) -> Result<Remediation> {
        let session = match self.fleet.transport.open(node).await {
            Ok(session) => session,
            Err(FleetError::Connectivity { reason, .. }) => {
                warn!(node = %node.name, reason = %reason, "Node unreachable");
                return Ok(Remediation::Unreachable);
            }
            Err(e) => return Err(e),
        };

        let result = AssertUnwindSafe(self.remediate(node, session.as_ref()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(FleetError::from_panic(payload)));
        session.close().await;
        result
    }

    async fn remediate(&self, node: &Node, session: &dyn Session) -> Result<Remediation> {
        let inspection = inspect(&self.fleet, node, session).await?;
        if !inspection.status.connectivity {
            return Ok(Remediation::Unreachable);
        }

        let identity = self.fleet.identity_for(node);
        let supervisor = &self.fleet.supervisor;

        if !inspection.is_registered() {
            info!(node = %node.name, "Not registered, registering");
            supervisor.stop(session).await?;
            let outcome = self.registrar.register(session, &identity, self.timeout).await?;
            return Ok(Remediation::Registered(outcome));
        }

        if !inspection.is_active() || !inspection.status.running.is_true() {
            info!(
                node = %node.name,
                job = supervisor.job_name(),
                active = inspection.is_active(),
                running = ?inspection.status.running,
                "Restarting job"
            );
            let job = self.fleet.job_for(node).ok_or_else(|| {
                FleetError::Unexpected(format!("no job command configured for {}", node.name))
            })?;

            identity::stage(
                session,
                &identity,
                &self.fleet.config.identity.remote_root,
                IdentitySlot::Default,
            )
            .await?;
            supervisor.stop(session).await?;
            supervisor
                .start(session, &job, &self.fleet.placeholders(node))
                .await?;
            return Ok(Remediation::Restarted);
        }

        Ok(Remediation::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::cancel_pair;
    use crate::fleet::testing::fake_fleet;
    use crate::identity::write_local_identity;
    use crate::ledger::sample_info;
    use crate::config::MachineConfig;
    use crate::inventory::{InventoryProvider, NodeFilter};
    use crate::remote::fake::{FakeFleet, FakeLedger};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REMOTE_ROOT: &str = "/root/.bittensor/wallets";
    const INSTALL_DIR: &str = "~/.bittensor/bittensor";

    struct Scenario {
        _dir: tempfile::TempDir,
        hosts: FakeFleet,
        ledger: Arc<FakeLedger>,
        reconciler: Reconciler,
    }

    /// alpha is unreachable, bravo is unregistered, charlie is registered
    /// with its job down
    fn scenario() -> Scenario {
        let dir = tempfile::tempdir().unwrap();
        for name in ["alpha", "bravo", "charlie"] {
            write_local_identity(dir.path(), "default", name);
        }
        let bundle = dir.path().join("register.py");
        std::fs::write(&bundle, "print('registering')").unwrap();

        let hosts = FakeFleet::new();
        hosts.add_host("alpha").unreachable();
        hosts.add_host("bravo").installed(INSTALL_DIR, "master");
        hosts.add_host("charlie").installed(INSTALL_DIR, "master");

        let ledger = Arc::new(FakeLedger::new());
        ledger.register("5Hotcharlie", sample_info(3, true));

        let mut fleet = fake_fleet(&["alpha", "bravo", "charlie"], dir.path(), &hosts, ledger.clone());
        fleet.config.registration.bundle_path = bundle;
        let reconciler = Reconciler::new(Arc::new(fleet), 5, Duration::from_secs(30));

        Scenario {
            _dir: dir,
            hosts,
            ledger,
            reconciler,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_node_cycle() {
        let sc = scenario();
        // One lookup each for the report and the inspection, then confirmed
        sc.ledger.register_after("5Hotbravo", 2, sample_info(2, true));

        let summary = sc.reconciler.cycle(&Cancel::never()).await.unwrap();
        let outcome = |name: &str| {
            summary
                .remediations
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, r)| r.as_ref().ok().cloned())
                .unwrap()
        };

        assert_eq!(summary.report.rows.len(), 3);
        assert!(summary.report.rows[0].status.is_none());

        assert_eq!(outcome("alpha"), Some(Remediation::Unreachable));
        assert_eq!(
            outcome("bravo"),
            Some(Remediation::Registered(RegistrationOutcome::Registered(sample_info(2, true))))
        );
        assert_eq!(outcome("charlie"), Some(Remediation::Restarted));

        let bravo = sc.hosts.host("bravo");
        assert_eq!(bravo.registration_launches(), 1);
        assert!(!bravo.is_registration_running());
        assert_eq!(bravo.job_starts(), 0);

        let charlie = sc.hosts.host("charlie");
        assert!(charlie.job_pid("script").is_some());
        assert_eq!(charlie.registration_launches(), 0);
        assert!(charlie
            .file(&IdentitySlot::Default.operational_key_path(REMOTE_ROOT))
            .unwrap()
            .contains("5Hotcharlie"));
        let start = charlie
            .commands()
            .into_iter()
            .find(|c| c.starts_with("pm2 start"))
            .unwrap();
        assert!(start.contains("--name script"));

        for name in ["bravo", "charlie"] {
            assert_eq!(sc.hosts.host(name).open_sessions(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_node_is_left_alone() {
        let sc = scenario();
        sc.hosts.host("charlie").with_job("script");
        let node = sc
            .reconciler
            .fleet
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.name == "charlie")
            .unwrap();

        let remediation = sc.reconciler.reconcile(&node).await.unwrap();
        assert_eq!(remediation, Remediation::Healthy);
        assert_eq!(sc.hosts.host("charlie").job_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_node_is_restarted() {
        let sc = scenario();
        sc.ledger.register("5Hotcharlie", sample_info(3, false));
        let charlie = sc.hosts.host("charlie");
        charlie.with_job("script");
        let before = charlie.job_pid("script");
        let node = sc
            .reconciler
            .fleet
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.name == "charlie")
            .unwrap();

        let remediation = sc.reconciler.reconcile(&node).await.unwrap();
        assert_eq!(remediation, Remediation::Restarted);
        assert_ne!(charlie.job_pid("script"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_error_does_not_stop_cycle() {
        let sc = scenario();
        sc.ledger.register("5Hotbravo", sample_info(2, true));
        sc.hosts.host("bravo").with_job("script");
        sc.hosts.host("charlie").fail_command("pm2 start");

        let summary = sc.reconciler.cycle(&Cancel::never()).await.unwrap();
        assert_eq!(summary.remediations.len(), 3);
        let outcome = |name: &str| {
            &summary
                .remediations
                .iter()
                .find(|(n, _)| n == name)
                .unwrap()
                .1
        };
        assert!(matches!(outcome("charlie"), Err(FleetError::RemoteCommand { .. })));
        assert!(matches!(outcome("bravo"), Ok(Remediation::Healthy)));
        assert_eq!(sc.hosts.host("charlie").open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_node_becomes_unexpected() {
        let sc = scenario();
        sc.hosts.host("bravo").panic_on("pm2 delete");
        sc.ledger.register_after("5Hotbravo", 2, sample_info(2, true));

        let summary = sc.reconciler.cycle(&Cancel::never()).await.unwrap();
        let bravo = summary
            .remediations
            .iter()
            .find(|(n, _)| n == "bravo")
            .unwrap();
        assert!(matches!(bravo.1, Err(FleetError::Unexpected(_))));
        assert_eq!(sc.hosts.host("bravo").open_sessions(), 0);
        assert_eq!(summary.remediations.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_caps_nodes_per_cycle() {
        let mut sc = scenario();
        sc.ledger.register("5Hotbravo", sample_info(2, true));
        sc.reconciler.limit = Some(2);

        let summary = sc.reconciler.cycle(&Cancel::never()).await.unwrap();
        assert_eq!(summary.remediations.len(), 2);
        assert_eq!(summary.report.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_returns() {
        let sc = scenario();
        let (handle, cancel) = cancel_pair();
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(5), sc.reconciler.run(&cancel))
            .await
            .unwrap();
        assert_eq!(sc.ledger.lookups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_cycle_remediates_nothing() {
        let sc = scenario();
        let (handle, cancel) = cancel_pair();
        handle.cancel();

        let summary = sc.reconciler.cycle(&cancel).await.unwrap();

        assert!(summary.remediations.is_empty());
        assert!(summary.report.rows.iter().all(|row| row.status.is_none()));
        assert_eq!(sc.hosts.host("charlie").job_starts(), 0);
    }

    /// Lists nothing, counting how often it was asked
    #[derive(Default)]
    struct EmptyInventory {
        lists: AtomicUsize,
    }

    #[async_trait]
    impl InventoryProvider for EmptyInventory {
        async fn list(&self, _filter: &NodeFilter) -> Result<Vec<Node>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn create(&self, name: &str, _machine: &MachineConfig) -> Result<String> {
            Err(FleetError::Inventory(format!("cannot create {}", name)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_inventory_waits_between_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut fleet = fake_fleet(&[], dir.path(), &FakeFleet::new(), Arc::new(FakeLedger::new()));
        let inventory = Arc::new(EmptyInventory::default());
        fleet.inventory = inventory.clone();
        let reconciler = Arc::new(Reconciler::new(Arc::new(fleet), 5, Duration::from_secs(30)));

        let (handle, cancel) = cancel_pair();
        let running = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.cancel();
        running.await.unwrap();

        // Cycles at 0s, 5s and 10s
        let lists = inventory.lists.load(Ordering::SeqCst);
        assert!((2..=4).contains(&lists), "listed {} times", lists);
    }
}
