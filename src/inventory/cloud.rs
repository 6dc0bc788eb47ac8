//! Cloud-backed inventory (DigitalOcean-style REST API)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Credentials, InventoryProvider, Node, NodeFilter};
use crate::config::MachineConfig;
use crate::error::{FleetError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 200;

pub struct CloudInventory {
    client: reqwest::Client,
    api_url: String,
    token: String,
    cluster: String,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    region: Option<Region>,
    #[serde(default)]
    size_slug: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Region {
    #[serde(default)]
    name: Option<String>,
    slug: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    ssh_keys: Vec<u64>,
    tags: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct KeyList {
    ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Deserialize)]
struct SshKey {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: String,
    name: String,
}

impl Droplet {
    fn public_address(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str())
    }
}

impl CloudInventory {
    pub fn new(
        api_url: String,
        token: String,
        cluster: String,
        credentials: Credentials,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FleetError::Inventory(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            cluster,
            credentials,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| FleetError::Inventory(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Inventory(format!(
                "GET {} failed: HTTP {}",
                path,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| FleetError::Inventory(format!("invalid response from {}: {}", path, e)))
    }

    fn to_node(&self, droplet: Droplet) -> Option<Node> {
        let Some(address) = droplet.public_address().map(str::to_string) else {
            warn!(node = %droplet.name, "Instance has no public address yet, skipping");
            return None;
        };

        Some(Node {
            name: droplet.name,
            address,
            credentials: self.credentials.clone(),
            tags: droplet.tags,
            region: droplet.region.map(|r| r.name.unwrap_or(r.slug)),
            size: droplet.size_slug,
        })
    }

    /// Assign a new instance to the project named after the cluster, if any
    async fn assign_to_project(&self, droplet_id: u64) -> Result<()> {
        let projects: ProjectList = self.get("/projects").await?;
        let Some(project) = projects.projects.into_iter().find(|p| p.name == self.cluster) else {
            debug!(cluster = %self.cluster, "No project named after cluster");
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/projects/{}/resources", self.api_url, project.id))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "resources": [format!("do:droplet:{}", droplet_id)],
            }))
            .send()
            .await
            .map_err(|e| FleetError::Inventory(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Inventory(format!(
                "project assignment failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryProvider for CloudInventory {
    async fn list(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let path = format!("/droplets?tag_name={}&per_page={}", filter.cluster, PAGE_SIZE);
        let list: DropletList = self.get(&path).await?;

        let nodes: Vec<Node> = list
            .droplets
            .into_iter()
            .filter(|d| filter.matches(&d.name))
            .filter_map(|d| self.to_node(d))
            .collect();

        debug!(count = nodes.len(), cluster = %filter.cluster, "Listed cloud nodes");
        Ok(nodes)
    }

    async fn create(&self, name: &str, machine: &MachineConfig) -> Result<String> {
        let missing = |field: &str| {
            FleetError::Inventory(format!("machine {} has no {} configured", name, field))
        };
        let region = machine.region.as_deref().ok_or_else(|| missing("region"))?;
        let size = machine.size.as_deref().ok_or_else(|| missing("size"))?;
        let image = machine.image.as_deref().ok_or_else(|| missing("image"))?;

        let keys: KeyList = self.get("/account/keys").await?;

        let request = CreateRequest {
            name,
            region,
            size,
            image,
            ssh_keys: keys.ssh_keys.iter().map(|k| k.id).collect(),
            tags: vec![self.cluster.as_str()],
        };

        let response = self
            .client
            .post(format!("{}/droplets", self.api_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| FleetError::Inventory(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Inventory(format!(
                "create {} failed: HTTP {}",
                name,
                response.status()
            )));
        }

        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| FleetError::Inventory(e.to_string()))?;
        let id = created.droplet.id;
        info!(node = %name, id, "Instance created");

        if let Err(e) = self.assign_to_project(id).await {
            warn!(node = %name, error = %e, "Failed to assign instance to project");
        }

        Ok(id.to_string())
    }
}
