//! Hetzner Cloud compute provider.
//!
//! Resolves IPs to server ids within one location and terminates servers.
//! API documentation: <https://docs.hetzner.cloud>

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::LbError;
use crate::instances::{ComputeProvider, IpSet};

/// Hetzner Cloud API base URL
const HCLOUD_API_BASE: &str = "https://api.hetzner.cloud/v1";
/// Servers per list page (the API maximum)
const PAGE_SIZE: u32 = 50;

/// Hetzner Cloud-backed [`ComputeProvider`] scoped to one location.
#[derive(Debug)]
pub struct HcloudProvider {
    client: Client,
    token: String,
    location: String,
}

impl HcloudProvider {
    /// Create a provider for servers in `location` (e.g. "fsn1").
    pub fn new(location: &str, token: &str, timeout: Duration) -> Result<Self, LbError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LbError::Configuration(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            token: token.to_string(),
            location: location.to_string(),
        })
    }

    /// List every server in the project, following pagination.
    async fn list_servers(&self) -> Result<Vec<Server>, LbError> {
        let mut servers = Vec::new();
        let mut page = 1u32;
        loop {
            let response = self
                .client
                .get(format!("{}/servers", HCLOUD_API_BASE))
                .query(&[("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())])
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| LbError::Compute(format!("failed to list servers: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(LbError::Compute(format!(
                    "failed to list servers: HTTP {} - {}",
                    status, body
                )));
            }

            let parsed: ServersResponse = response
                .json()
                .await
                .map_err(|e| LbError::Compute(format!("failed to parse servers: {}", e)))?;
            servers.extend(parsed.servers);

            match parsed.meta.pagination.next_page {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(servers)
    }
}

#[async_trait]
impl ComputeProvider for HcloudProvider {
    async fn describe(&self, ips: &IpSet) -> Result<HashMap<String, Option<String>>, LbError> {
        let servers = self.list_servers().await?;
        let mut by_ip: HashMap<&str, u64> = HashMap::new();
        for server in &servers {
            if server.datacenter.location.name != self.location {
                continue;
            }
            if let Some(ipv4) = &server.public_net.ipv4 {
                by_ip.insert(ipv4.ip.as_str(), server.id);
            }
        }
        let mapped = ips
            .iter()
            .map(|ip| {
                (
                    ip.clone(),
                    by_ip.get(ip.as_str()).map(|id| id.to_string()),
                )
            })
            .collect();
        debug!(location = %self.location, requested = ips.len(), "described servers");
        Ok(mapped)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), LbError> {
        for id in instance_ids {
            let response = self
                .client
                .delete(format!("{}/servers/{}", HCLOUD_API_BASE, id))
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| LbError::Compute(format!("failed to delete server {}: {}", id, e)))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(LbError::Compute(format!(
                    "failed to delete server {}: HTTP {} - {}",
                    id, status, body
                )));
            }
            info!(server_id = %id, "terminated server");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<Server>,
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    public_net: PublicNet,
    datacenter: Datacenter,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct Datacenter {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}
