use std::sync::Arc;
use tracing::info;

use super::{choose, RegisterArgs};
use crate::batch::{run_parallel, Cancel};
use crate::error::Result;
use crate::fleet::Fleet;
use crate::registration::{Registrar, RegistrationOutcome};

/// Register every chosen node concurrently, two workers per node
pub async fn fast_register(fleet: &Arc<Fleet>, args: &RegisterArgs, cancel: &Cancel) -> Result<String> {
    let nodes = choose(fleet.nodes().await?, args.worker_limit());
    let workers = nodes.len() * 2;
    info!(nodes = nodes.len(), procs = args.procs, timeout_secs = args.timeout, "Registering");

    let registrar = Arc::new(Registrar::new(
        fleet.ledger.clone(),
        &fleet.config.registration,
        &fleet.config.identity.remote_root,
        args.procs,
    ));
    let timeout = args.timeout();
    let shared = fleet.clone();

    let report = run_parallel(nodes, workers, cancel, move |node| {
        let fleet = shared.clone();
        let registrar = registrar.clone();
        async move {
            let session = fleet.transport.open(&node).await?;
            let identity = fleet.identity_for(&node);
            let outcome = registrar.register(session.as_ref(), &identity, timeout).await;
            session.close().await;
            outcome
        }
    })
    .await;

    Ok(report.render(|outcome| match outcome {
        RegistrationOutcome::Registered(info) => format!("registered (uid {})", info.uid),
        RegistrationOutcome::TimedOut => "timed out".to_string(),
    }))
}
