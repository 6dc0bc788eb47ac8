//! Error taxonomy for per-node fleet operations
//!
//! Every variant here is contained at the per-node boundary: the batch
//! executor and the reconciliation loop log it against the node and move on.
//! Only configuration errors (see `config::ConfigError`) abort the process.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while operating on a single node
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("cannot connect to {node}: {reason}")]
    Connectivity { node: String, reason: String },

    #[error("`{command}` exited with status {status} on {node}: {stderr}")]
    RemoteCommand {
        node: String,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("`{command}` on {node} timed out after {timeout:?}")]
    CommandTimeout {
        node: String,
        command: String,
        timeout: Duration,
    },

    #[error("transfer of {local} to {node}:{remote} failed: {reason}")]
    Transfer {
        node: String,
        local: PathBuf,
        remote: String,
        reason: String,
    },

    #[error("identity material missing: {0}")]
    MissingIdentity(PathBuf),

    #[error("identity mismatch on {node} ({file}): local {local}, staged {staged}")]
    IdentityMismatch {
        node: String,
        file: String,
        local: String,
        staged: String,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Configuration-level failures that will not fix themselves on retry
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FleetError::MissingIdentity(_) | FleetError::IdentityMismatch { .. }
        )
    }

    /// Turn a caught panic payload into an `Unexpected` error
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        FleetError::Unexpected(message)
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
