use std::sync::Arc;
use tracing::info;

use super::RegisterArgs;
use crate::batch::Cancel;
use crate::error::Result;
use crate::fleet::Fleet;
use crate::monit::Reconciler;

/// Runs until `cancel` fires
pub async fn monit(fleet: Arc<Fleet>, args: &RegisterArgs, cancel: &Cancel) -> Result<String> {
    info!(procs = args.procs, timeout_secs = args.timeout, "Starting monitor");
    Reconciler::new(fleet, args.procs, args.timeout())
        .with_limit(args.worker_limit())
        .run(cancel)
        .await;
    Ok("Monitor stopped".to_string())
}
