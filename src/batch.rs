//! Batch executor - one operation over many nodes, bounded and isolated
//!
//! Every node runs in its own tokio task behind a semaphore. An error or a
//! panic inside one node's operation becomes that node's `Failed` outcome and
//! never touches the others.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{FleetError, Result};
use crate::inventory::Node;

/// Cancellation signal observed by batches and the reconciliation loop
#[derive(Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

/// Fires the paired `Cancel`
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancel { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Cancel {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
pub enum NodeOutcome<T> {
    Succeeded(T),
    Failed(FleetError),
    /// Cancelled before the node's operation started
    Skipped,
}

#[derive(Debug)]
pub struct NodeResult<T> {
    pub node: Node,
    pub outcome: NodeOutcome<T>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Outcomes of one batch, sorted by node name
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<NodeResult<T>>,
}

impl<T> BatchReport<T> {
    pub fn summary(&self) -> BatchSummary {
        self.results
            .iter()
            .fold(BatchSummary::default(), |mut summary, result| {
                match result.outcome {
                    NodeOutcome::Succeeded(_) => summary.succeeded += 1,
                    NodeOutcome::Failed(_) => summary.failed += 1,
                    NodeOutcome::Skipped => summary.skipped += 1,
                }
                summary
            })
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&NodeOutcome<T>> {
        self.results
            .iter()
            .find(|r| r.node.name == name)
            .map(|r| &r.outcome)
    }

    /// Per-node lines for the operator, one per node
    pub fn render(&self, describe: impl Fn(&T) -> String) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.node.name.len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        for result in &self.results {
            let line = match &result.outcome {
                NodeOutcome::Succeeded(value) => format!("ok      {}", describe(value)),
                NodeOutcome::Failed(e) => format!("FAILED  {}", e),
                NodeOutcome::Skipped => "skipped".to_string(),
            };
            out.push_str(&format!("{:<width$}  {}\n", result.node.name, line, width = width));
        }

        let summary = self.summary();
        out.push_str(&format!(
            "{} succeeded, {} failed, {} skipped\n",
            summary.succeeded, summary.failed, summary.skipped
        ));
        out
    }
}

/// Run `op` on every node with at most `max_workers` in flight.
///
/// Once `cancel` fires, nodes that have not started yet are `Skipped`;
/// operations already running finish.
pub async fn run_parallel<T, F, Fut>(
    nodes: Vec<Node>,
    max_workers: usize,
    cancel: &Cancel,
    op: F,
) -> BatchReport<T>
where
    T: Send + 'static,
    F: Fn(Node) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = nodes.len();
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let completed = Arc::new(AtomicUsize::new(0));
    let op = Arc::new(op);
    let mut tasks = JoinSet::new();

    for node in nodes {
        let semaphore = semaphore.clone();
        let completed = completed.clone();
        let cancel = cancel.clone();
        let op = op.clone();

        tasks.spawn(async move {
            let permit = semaphore.acquire_owned().await;

            let outcome = if permit.is_err() || cancel.is_cancelled() {
                NodeOutcome::Skipped
            } else {
                let target = node.clone();
                let run = AssertUnwindSafe(async move { op(target).await });
                match run.catch_unwind().await {
                    Ok(Ok(value)) => NodeOutcome::Succeeded(value),
                    Ok(Err(e)) => {
                        warn!(node = %node.name, error = %e, "Node operation failed");
                        NodeOutcome::Failed(e)
                    }
                    Err(payload) => {
                        let e = FleetError::from_panic(payload);
                        error!(node = %node.name, error = %e, "Node operation panicked");
                        NodeOutcome::Failed(e)
                    }
                }
            };
            drop(permit);

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            info!(node = %node.name, progress = %format!("{}/{}", done, total), "Node finished");

            NodeResult { node, outcome }
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Batch task aborted"),
        }
    }
    results.sort_by(|a, b| a.node.name.cmp(&b.node.name));

    BatchReport { results }
}
