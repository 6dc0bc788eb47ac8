//! Fleet configuration
//!
//! Loaded from a TOML file. Every section except `inventory` and `machines`
//! has defaults so a minimal file only names the cluster, the inventory
//! source and the machines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::Identity;
use crate::supervisor::ArgGroups;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster name; also the cloud tag and project name
    pub cluster: String,

    /// Worker pool size for batch commands
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Substituted for `$SECRET` in job arguments
    #[serde(default)]
    pub shared_secret: String,

    #[serde(default)]
    pub ssh: SshConfig,

    pub inventory: InventoryConfig,

    #[serde(default)]
    pub software: SoftwareConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Managed machines keyed by node name
    pub machines: BTreeMap<String, MachineConfig>,
}

/// Where the node list comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryConfig {
    /// DigitalOcean-style cloud API, nodes found by cluster tag
    Cloud {
        #[serde(default = "default_api_url")]
        api_url: String,
        /// API token (overridable with FLEET_CLOUD_TOKEN)
        #[serde(default)]
        token: String,
    },
    /// Addresses listed under `[machines.*]`
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key used for every node
    #[serde(default = "default_ssh_key")]
    pub key: PathBuf,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Default timeout for remote commands without an explicit one
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// The managed software checkout on each node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareConfig {
    #[serde(default = "default_repo_url")]
    pub repo_url: String,

    #[serde(default = "default_install_dir")]
    pub install_dir: String,

    /// Exits zero iff the software is usable
    #[serde(default = "default_check_command")]
    pub check_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Local wallet directory
    #[serde(default = "default_wallet_root")]
    pub wallet_root: PathBuf,

    /// Wallet directory on the nodes
    #[serde(default = "default_remote_wallet_root")]
    pub remote_root: String,

    /// Wallet used when a machine names no coldkey
    #[serde(default = "default_wallet")]
    pub wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Overridable with FLEET_LEDGER_ENDPOINT
    #[serde(default = "default_ledger_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_ledger_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Local registration tool pushed to every node
    #[serde(default = "default_bundle_path")]
    pub bundle_path: PathBuf,

    #[serde(default = "default_bundle_remote_dir")]
    pub remote_dir: String,

    /// `$BUNDLE` and `$PROCS` are substituted before launch
    #[serde(default = "default_launch_command")]
    pub launch_command: String,

    /// Matched by `pkill -f` to find the running tool
    #[serde(default = "default_process_pattern")]
    pub process_pattern: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    /// Required for static inventories
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Script started under the supervisor
    #[serde(default)]
    pub command: String,

    /// Wallet holding this node's identity
    #[serde(default)]
    pub coldkey: Option<String>,

    /// Argument groups rendered as `--group.key value`
    #[serde(default)]
    pub args: ArgGroups,

    #[serde(default)]
    pub extra_args: String,
}

/// Configuration errors abort the whole process
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// Defaults
fn default_max_threads() -> usize { num_cpus::get().max(4) }
fn default_api_url() -> String { "https://api.digitalocean.com/v2".to_string() }
fn default_ssh_user() -> String { "root".to_string() }
fn default_ssh_key() -> PathBuf { PathBuf::from("~/.ssh/id_rsa") }
fn default_ssh_port() -> u16 { 22 }
fn default_connect_timeout() -> u64 { 10 }
fn default_command_timeout() -> u64 { 120 }
fn default_repo_url() -> String { "https://github.com/opentensor/bittensor.git".to_string() }
fn default_install_dir() -> String { "~/.bittensor/bittensor".to_string() }
fn default_check_command() -> String { "python3 -c \"import bittensor\"".to_string() }
fn default_job_name() -> String { "script".to_string() }
fn default_interpreter() -> String { "python3".to_string() }
fn default_wallet_root() -> PathBuf { PathBuf::from("~/.bittensor/wallets") }
fn default_remote_wallet_root() -> String { "/root/.bittensor/wallets".to_string() }
fn default_wallet() -> String { "default".to_string() }
fn default_ledger_endpoint() -> String { "http://127.0.0.1:9933".to_string() }
fn default_ledger_timeout() -> u64 { 10 }
fn default_bundle_path() -> PathBuf { PathBuf::from("registration/register.py") }
fn default_bundle_remote_dir() -> String { "/root/fast_register".to_string() }
fn default_launch_command() -> String {
    "python3 $BUNDLE --wallet.name fast --wallet.hotkey fast --procs $PROCS".to_string()
}
fn default_process_pattern() -> String { "fast_register".to_string() }
fn default_poll_interval() -> u64 { 2 }
fn default_branch() -> String { "master".to_string() }

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key: default_ssh_key(),
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            repo_url: default_repo_url(),
            install_dir: default_install_dir(),
            check_command: default_check_command(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            interpreter: default_interpreter(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            wallet_root: default_wallet_root(),
            remote_root: default_remote_wallet_root(),
            wallet: default_wallet(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ledger_endpoint(),
            request_timeout_secs: default_ledger_timeout(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            bundle_path: default_bundle_path(),
            remote_dir: default_bundle_remote_dir(),
            launch_command: default_launch_command(),
            process_pattern: default_process_pattern(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl RegistrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Values taken from the environment or command line over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub cloud_token: Option<String>,
    pub ledger_endpoint: Option<String>,
}

impl Config {
    /// Read and parse a config file, apply overrides, then validate
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;
        config.expand_paths();
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(token) = &overrides.cloud_token {
            if let InventoryConfig::Cloud { token: current, .. } = &mut self.inventory {
                *current = token.clone();
            }
        }
        if let Some(endpoint) = &overrides.ledger_endpoint {
            self.ledger.endpoint = endpoint.clone();
        }
    }

    /// Reject configurations no command can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster must not be empty".into()));
        }
        if self.machines.is_empty() {
            return Err(ConfigError::Invalid("no machines configured".into()));
        }
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid("max_threads must be at least 1".into()));
        }
        if self.registration.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "registration.poll_interval_secs must be at least 1".into(),
            ));
        }
        match &self.inventory {
            InventoryConfig::Cloud { token, .. } if token.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "cloud inventory requires a token (inventory.token or FLEET_CLOUD_TOKEN)".into(),
                ));
            }
            InventoryConfig::Static => {
                if let Some((name, _)) = self.machines.iter().find(|(_, m)| m.address.is_none()) {
                    return Err(ConfigError::Invalid(format!(
                        "machine {} has no address but the inventory is static",
                        name
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Identity a node registers and runs with
    pub fn identity_for(&self, node_name: &str) -> Identity {
        let wallet = self
            .machines
            .get(node_name)
            .and_then(|m| m.coldkey.clone())
            .unwrap_or_else(|| self.identity.wallet.clone());
        Identity::new(&self.identity.wallet_root, wallet, node_name)
    }

    fn expand_paths(&mut self) {
        self.ssh.key = expand_home(&self.ssh.key);
        self.identity.wallet_root = expand_home(&self.identity.wallet_root);
        self.registration.bundle_path = expand_home(&self.registration.bundle_path);
    }
}

/// Expand a leading `~` against $HOME for local paths
pub fn expand_home(path: &Path) -> PathBuf {
    expand_home_in(path, std::env::var_os("HOME").as_deref().map(Path::new))
}

fn expand_home_in(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
