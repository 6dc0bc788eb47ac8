use std::sync::Arc;

use crate::batch::Cancel;
use crate::error::Result;
use crate::fleet::Fleet;
use crate::report::build_report;

pub async fn status(fleet: &Arc<Fleet>, cancel: &Cancel) -> Result<String> {
    let nodes = fleet.nodes().await?;
    let report = build_report(fleet, nodes, cancel).await;
    Ok(report.render())
}
