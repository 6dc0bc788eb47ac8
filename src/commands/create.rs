//! Provision configured machines that the inventory does not know yet

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use tracing::{error, info};

use crate::error::Result;
use crate::fleet::Fleet;

pub async fn create(fleet: &Fleet) -> Result<String> {
    let existing: BTreeSet<String> = fleet.nodes().await?.into_iter().map(|n| n.name).collect();

    let wanted: Vec<&String> = fleet
        .config
        .machines
        .keys()
        .filter(|name| fleet.filter.matches(name))
        .collect();

    let mut lines: Vec<(String, String)> = stream::iter(wanted)
        .map(|name| {
            let existing = &existing;
            async move {
                if existing.contains(name) {
                    info!(node = %name, "Machine already exists");
                    return (name.clone(), "exists".to_string());
                }
                let machine = &fleet.config.machines[name];
                match fleet.inventory.create(name, machine).await {
                    Ok(id) => {
                        info!(node = %name, id = %id, "Machine created");
                        (name.clone(), format!("created (id {})", id))
                    }
                    Err(e) => {
                        error!(node = %name, error = %e, "Failed to create machine");
                        (name.clone(), format!("FAILED  {}", e))
                    }
                }
            }
        })
        .buffer_unordered(fleet.config.max_threads.max(1))
        .collect()
        .await;

    lines.sort();
    Ok(lines
        .into_iter()
        .map(|(name, line)| format!("{}: {}\n", name, line))
        .collect())
}
