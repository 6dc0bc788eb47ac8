//! Ledger client - is an identity registered, and how is it doing
//!
//! Lookups are read-only and carry no shared mutable state, so one client is
//! shared by `Arc` across every worker of a batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use crate::config::LedgerConfig;

/// Ledger record for one identity. Never cached: every probe asks again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub is_registered: bool,
    pub uid: u64,
    pub stake: f64,
    pub rank: f64,
    pub trust: f64,
    pub consensus: f64,
    pub incentive: f64,
    pub dividends: f64,
    pub emission: f64,
    /// Block of the identity's last update
    pub last_update: u64,
    pub active: bool,
}

impl RegistrationInfo {
    /// Summable metrics in report column order
    pub fn metrics(&self) -> [f64; 7] {
        [
            self.stake,
            self.rank,
            self.trust,
            self.consensus,
            self.incentive,
            self.dividends,
            self.emission,
        ]
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("lookup rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// `None` when the identity is not registered
    async fn lookup(&self, address: &str) -> Result<Option<RegistrationInfo>, LedgerError>;
}

/// JSON-over-HTTP ledger gateway
pub struct HttpLedgerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLedgerClient {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn lookup(&self, address: &str) -> Result<Option<RegistrationInfo>, LedgerError> {
        let response = self
            .client
            .get(format!("{}/neurons/{}", self.endpoint, address))
            .send()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            trace!(address, "Identity not on ledger");
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(LedgerError::Rejected(format!("HTTP {}", response.status())));
        }

        let info: Option<RegistrationInfo> = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        Ok(info.filter(|i| i.is_registered))
    }
}

#[cfg(test)]
pub(crate) fn sample_info(uid: u64, active: bool) -> RegistrationInfo {
    RegistrationInfo {
        is_registered: true,
        uid,
        stake: 1.5,
        rank: 0.25,
        trust: 0.5,
        consensus: 0.125,
        incentive: 0.0625,
        dividends: 0.03125,
        emission: 2.0,
        last_update: 1000 + uid,
        active,
    }
}
