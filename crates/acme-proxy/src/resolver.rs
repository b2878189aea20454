//! Host-to-peer resolution for the public surface.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::{Resolver, TokioResolver};

use crate::server::ProxyError;

/// Resolves the `Host` of a public request to candidate peer IPs.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProxyError>;
}

/// System-configured DNS resolution.
#[derive(Debug)]
pub struct DnsHostResolver {
    resolver: TokioResolver,
}

impl DnsHostResolver {
    pub fn new() -> Result<Self, ProxyError> {
        let resolver = Resolver::builder_tokio()
            .map_err(|e| ProxyError::Configuration(format!("failed to build resolver: {}", e)))?
            .build();
        Ok(Self { resolver })
    }
}

#[async_trait]
impl HostResolver for DnsHostResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProxyError> {
        // IP literals stand for themselves.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProxyError::Resolve(format!("{}: {}", host, e)))?;
        Ok(lookup.iter().collect())
    }
}
