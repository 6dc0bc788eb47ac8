//! Statically configured inventory

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{Credentials, InventoryProvider, Node, NodeFilter};
use crate::config::MachineConfig;
use crate::error::{FleetError, Result};

/// Nodes taken from `[machines.*]` addresses
pub struct StaticInventory {
    machines: BTreeMap<String, MachineConfig>,
    credentials: Credentials,
}

impl StaticInventory {
    pub fn new(machines: BTreeMap<String, MachineConfig>, credentials: Credentials) -> Self {
        Self {
            machines,
            credentials,
        }
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn list(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self
            .machines
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .filter_map(|(name, machine)| {
                let address = machine.address.clone()?;
                let mut tags = machine.tags.clone();
                if tags.is_empty() {
                    tags.push(filter.cluster.clone());
                }
                Some(Node {
                    name: name.clone(),
                    address,
                    credentials: self.credentials.clone(),
                    tags,
                    region: machine.region.clone(),
                    size: machine.size.clone(),
                })
            })
            .collect())
    }

    async fn create(&self, name: &str, _machine: &MachineConfig) -> Result<String> {
        Err(FleetError::Inventory(format!(
            "cannot create {}: static inventories do not provision machines",
            name
        )))
    }
}
