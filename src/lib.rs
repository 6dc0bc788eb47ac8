//! fleetwatch: health monitoring and remediation for a fleet of
//! ledger-registered compute nodes
//!
//! Nodes come from an inventory (cloud API or static list) and are reached
//! over ssh. Probers read their state, the supervisor adapter manages the
//! long-lived job, and the registration orchestrator puts identities on the
//! ledger. Bulk commands run through the batch executor; `monit` runs the
//! reconciliation loop.

pub mod batch;
pub mod commands;
pub mod config;
pub mod error;
pub mod fleet;
pub mod identity;
pub mod inventory;
pub mod ledger;
pub mod monit;
pub mod probe;
pub mod registration;
pub mod remote;
pub mod report;
pub mod supervisor;

pub use config::Config;
pub use error::{FleetError, Result};
pub use fleet::Fleet;
