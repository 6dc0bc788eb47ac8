//! CLI subcommands
//!
//! Each command works against a `Fleet` and returns the text to print.
//! Per-node failures are part of that text; only inventory failures come
//! back as errors.

pub mod checkout;
pub mod create;
pub mod fast_register;
pub mod monit;
pub mod status;

use clap::{Args, Subcommand};
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::Cancel;
use crate::config::Overrides;
use crate::error::Result;
use crate::fleet::Fleet;
use crate::inventory::Node;

/// Flags every subcommand takes
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Config file to use
    #[arg(short, long, default_value = "fleet.toml")]
    pub config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    pub debug: bool,

    /// Nodes (machine names) to operate on; all configured machines if omitted
    #[arg(short, long, num_args = 0..)]
    pub names: Option<Vec<String>>,

    /// Cloud API token
    #[arg(long, env = "FLEET_CLOUD_TOKEN", hide_env_values = true)]
    pub cloud_token: Option<String>,

    /// Ledger gateway endpoint
    #[arg(long, env = "FLEET_LEDGER_ENDPOINT")]
    pub ledger_endpoint: Option<String>,
}

impl CommonArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            cloud_token: self.cloud_token.clone(),
            ledger_endpoint: self.ledger_endpoint.clone(),
        }
    }
}

/// Registration tuning shared by `fast_register` and `monit`
#[derive(Debug, Clone, Args)]
pub struct RegisterArgs {
    /// Concurrent solver processes per registration
    #[arg(short, long, default_value_t = 5)]
    pub procs: usize,

    /// Registration timeout in seconds
    #[arg(short, long, default_value_t = 7200)]
    pub timeout: u64,

    /// Number of nodes to work on, -1 for all
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub workers: i64,
}

impl RegisterArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// `None` means every node
    pub fn worker_limit(&self) -> Option<usize> {
        usize::try_from(self.workers).ok()
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create configured machines missing from the cloud
    Create {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Reinstall the managed software at each machine's branch
    Checkout {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the fleet status table
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Register node identities on the ledger
    #[command(name = "fast_register", alias = "fast-register")]
    FastRegister {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        register: RegisterArgs,
    },

    /// Monitor the fleet and remediate drift until interrupted
    Monit {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        register: RegisterArgs,
    },
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Create { common }
            | Commands::Checkout { common }
            | Commands::Status { common }
            | Commands::FastRegister { common, .. }
            | Commands::Monit { common, .. } => common,
        }
    }
}

/// Execute a command against the fleet
pub async fn execute(fleet: Arc<Fleet>, command: &Commands, cancel: &Cancel) -> Result<String> {
    match command {
        Commands::Create { .. } => create::create(&fleet).await,
        Commands::Checkout { .. } => checkout::checkout(&fleet, cancel).await,
        Commands::Status { .. } => status::status(&fleet, cancel).await,
        Commands::FastRegister { register, .. } => {
            fast_register::fast_register(&fleet, register, cancel).await
        }
        Commands::Monit { register, .. } => monit::monit(fleet, register, cancel).await,
    }
}

/// A random subset of `limit` nodes, or all of them
pub(crate) fn choose(mut nodes: Vec<Node>, limit: Option<usize>) -> Vec<Node> {
    if let Some(limit) = limit {
        nodes.shuffle(&mut rand::thread_rng());
        nodes.truncate(limit);
    }
    nodes
}
