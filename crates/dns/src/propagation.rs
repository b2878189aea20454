//! Resolver-side confirmation of record changes.
//!
//! Used to implement the `wait` flag of [`RecordStore::write_records`]:
//! after a write, poll public resolvers until every written value is
//! visible. Caching is disabled so a previous answer cannot satisfy the
//! check.
//!
//! [`RecordStore::write_records`]: crate::RecordStore::write_records

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use flotilla_common::RecordType;

use crate::store::RecordStoreError;

/// Configuration for propagation checking
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Delay before the first check
    pub initial_delay: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Maximum time to wait for propagation
    pub timeout: Duration,
    /// Nameservers to query (empty = system defaults)
    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google DNS
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare DNS
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), // Quad9
            ],
        }
    }
}

/// Polls resolvers until a record change is visible.
#[derive(Debug)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioResolver,
}

impl PropagationChecker {
    /// Create a checker with default configuration.
    pub fn new() -> Result<Self, RecordStoreError> {
        Self::with_config(PropagationConfig::default())
    }

    /// Create a checker with custom configuration.
    pub fn with_config(config: PropagationConfig) -> Result<Self, RecordStoreError> {
        let resolver = Self::create_resolver(&config)?;
        Ok(Self { config, resolver })
    }

    fn create_resolver(config: &PropagationConfig) -> Result<TokioResolver, RecordStoreError> {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config
                    .add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 3;
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Ok(resolver)
    }

    /// Wait until every value in `expected` is visible at `fqdn`.
    ///
    /// Returns a [`RecordStoreError::Timeout`] when the deadline passes;
    /// stores treating the provider as eventually consistent downgrade
    /// that to a warning.
    pub async fn wait_for_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
        expected: &[String],
    ) -> Result<(), RecordStoreError> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        debug!(
            fqdn = %fqdn,
            rtype = %rtype,
            timeout_secs = self.config.timeout.as_secs(),
            "waiting for record propagation"
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.check_records(fqdn, rtype, expected).await {
                Ok(true) => {
                    debug!(
                        fqdn = %fqdn,
                        elapsed_secs = start.elapsed().as_secs(),
                        "record propagation confirmed"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    trace!(fqdn = %fqdn, "records not yet propagated");
                }
                Err(e) => {
                    warn!(fqdn = %fqdn, error = %e, "DNS lookup error during propagation check");
                }
            }

            if Instant::now() > deadline {
                return Err(RecordStoreError::Timeout {
                    elapsed_secs: self.config.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// Check once whether every expected value is currently visible.
    pub async fn check_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
        expected: &[String],
    ) -> Result<bool, RecordStoreError> {
        let observed: Result<Vec<String>, String> = match rtype {
            RecordType::A => self
                .resolver
                .ipv4_lookup(fqdn)
                .await
                .map(|lookup| lookup.iter().map(|a| a.to_string()).collect())
                .map_err(|e| e.to_string()),
            RecordType::Txt => self
                .resolver
                .txt_lookup(fqdn)
                .await
                .map(|lookup| {
                    lookup
                        .iter()
                        .map(|record| {
                            record
                                .txt_data()
                                .iter()
                                .map(|data| String::from_utf8_lossy(data))
                                .collect::<String>()
                        })
                        .collect()
                })
                .map_err(|e| e.to_string()),
        };

        match observed {
            Ok(values) => {
                let observed: HashSet<&str> = values.iter().map(String::as_str).collect();
                Ok(expected.iter().all(|v| observed.contains(v.as_str())))
            }
            Err(e) => {
                // NXDOMAIN and empty answers are expected mid-propagation.
                let message = e.to_lowercase();
                if message.contains("no records found")
                    || message.contains("nxdomain")
                    || message.contains("no connections available")
                    || message.contains("record not found")
                {
                    Ok(false)
                } else {
                    Err(RecordStoreError::ApiRequest(format!(
                        "DNS lookup failed for '{}': {}",
                        fqdn, e
                    )))
                }
            }
        }
    }
}
