//! Shared handles every command works through

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::identity::Identity;
use crate::inventory::{self, InventoryProvider, Node, NodeFilter};
use crate::ledger::{HttpLedgerClient, LedgerClient};
use crate::probe::StateProber;
use crate::remote::{SshTransport, Transport};
use crate::supervisor::{JobSpec, Placeholders, Supervisor};

/// Configuration plus the collaborators built from it
pub struct Fleet {
    pub config: Config,
    pub inventory: Arc<dyn InventoryProvider>,
    pub transport: Arc<dyn Transport>,
    pub ledger: Arc<dyn LedgerClient>,
    pub supervisor: Supervisor,
    pub filter: NodeFilter,
}

impl Fleet {
    pub fn new(
        config: Config,
        inventory: Arc<dyn InventoryProvider>,
        transport: Arc<dyn Transport>,
        ledger: Arc<dyn LedgerClient>,
        names: Option<Vec<String>>,
    ) -> Self {
        let filter = NodeFilter::from_config(&config, names);
        let supervisor = Supervisor::new(&config.supervisor);
        Self {
            config,
            inventory,
            transport,
            ledger,
            supervisor,
            filter,
        }
    }

    /// Production wiring: configured inventory, OpenSSH, HTTP ledger
    pub fn connect(config: Config, names: Option<Vec<String>>) -> Result<Self> {
        let inventory = inventory::build_provider(&config)?;
        let transport = Arc::new(SshTransport::new(&config.ssh));
        let ledger = Arc::new(HttpLedgerClient::new(&config.ledger)?);
        Ok(Self::new(config, inventory, transport, ledger, names))
    }

    /// Current nodes, asked fresh from the inventory
    pub async fn nodes(&self) -> Result<Vec<Node>> {
        self.inventory.list(&self.filter).await
    }

    pub fn prober(&self) -> StateProber<'_> {
        StateProber::new(
            &self.config.software,
            &self.supervisor,
            &self.config.identity.remote_root,
        )
    }

    pub fn identity_for(&self, node: &Node) -> Identity {
        self.config.identity_for(&node.name)
    }

    pub fn placeholders<'a>(&'a self, node: &'a Node) -> Placeholders<'a> {
        Placeholders {
            node: &node.name,
            cluster: &self.config.cluster,
            secret: &self.config.shared_secret,
        }
    }

    /// The job configured for a node, if its machine entry names a command
    pub fn job_for(&self, node: &Node) -> Option<JobSpec<'_>> {
        let machine = self.config.machines.get(&node.name)?;
        if machine.command.trim().is_empty() {
            return None;
        }
        Some(JobSpec {
            command: &machine.command,
            args: &machine.args,
            extra_args: &machine.extra_args,
        })
    }
}
