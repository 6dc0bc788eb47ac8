//! Inventory - which nodes make up the fleet
//!
//! The provider is chosen once from configuration:
//! - `CloudInventory` asks the cloud API for instances tagged with the cluster
//! - `StaticInventory` reads addresses straight from `[machines.*]`
//!
//! Nodes are produced fresh on every `list` call and never cached.

pub mod cloud;
pub mod static_list;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, InventoryConfig, MachineConfig};
use crate::error::Result;

pub use cloud::CloudInventory;
pub use static_list::StaticInventory;

/// How to authenticate against a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub key: PathBuf,
    pub port: u16,
}

/// A managed remote compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub credentials: Credentials,
    pub tags: Vec<String>,
    pub region: Option<String>,
    pub size: Option<String>,
}

/// Which nodes an operation applies to
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Cluster tag
    pub cluster: String,
    /// Configured machine names; anything else in the cloud is ignored
    pub machines: BTreeSet<String>,
    /// Optional `--names` restriction
    pub names: Option<Vec<String>>,
}

impl NodeFilter {
    pub fn from_config(config: &Config, names: Option<Vec<String>>) -> Self {
        Self {
            cluster: config.cluster.clone(),
            machines: config.machines.keys().cloned().collect(),
            names: names.filter(|n| !n.is_empty()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.machines.contains(name)
            && self
                .names
                .as_ref()
                .map_or(true, |names| names.iter().any(|n| n == name))
    }
}

/// Source of node descriptors
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Current nodes matching the filter
    async fn list(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Provision a new node, returning the provider's id for it
    async fn create(&self, name: &str, machine: &MachineConfig) -> Result<String>;
}

/// Build the provider selected by `[inventory] kind`
pub fn build_provider(config: &Config) -> Result<Arc<dyn InventoryProvider>> {
    let credentials = Credentials {
        user: config.ssh.user.clone(),
        key: config.ssh.key.clone(),
        port: config.ssh.port,
    };

    let provider: Arc<dyn InventoryProvider> = match &config.inventory {
        InventoryConfig::Cloud { api_url, token } => Arc::new(CloudInventory::new(
            api_url.clone(),
            token.clone(),
            config.cluster.clone(),
            credentials,
        )?),
        InventoryConfig::Static => Arc::new(StaticInventory::new(
            config.machines.clone(),
            credentials,
        )),
    };
    Ok(provider)
}

#[cfg(test)]
pub(crate) fn test_node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        address: format!("10.0.0.{}", name.len()),
        credentials: Credentials {
            user: "root".into(),
            key: PathBuf::from("/keys/id_rsa"),
            port: 22,
        },
        tags: vec!["test-cluster".into()],
        region: Some("nyc1".into()),
        size: Some("s-1vcpu-1gb".into()),
    }
}
