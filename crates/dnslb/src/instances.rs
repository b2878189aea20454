//! Compute instance handling: region filtering and destruction.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::LbError;

/// A set of IP addresses in their string form.
pub type IpSet = BTreeSet<String>;

/// Restricts a set of IPs to the ones this controller may act on.
#[async_trait]
pub trait RegionFilter: Send + Sync {
    /// Return the subset of `ips` that are instances in this controller's
    /// region. An IP the provider cannot see is absent from the output.
    async fn filter(&self, ips: &IpSet) -> Result<IpSet, LbError>;
}

/// Terminates instances by IP.
#[async_trait]
pub trait Destroyer: Send + Sync {
    /// Terminate the instances behind `ips`; IPs without a matching
    /// instance are silently skipped.
    async fn destroy(&self, ips: &IpSet) -> Result<(), LbError>;
}

/// Pass-through filter and no-op destroyer, for preserve mode and
/// deployments without a compute provider.
#[derive(Debug, Default)]
pub struct NullHandler;

#[async_trait]
impl RegionFilter for NullHandler {
    async fn filter(&self, ips: &IpSet) -> Result<IpSet, LbError> {
        Ok(ips.clone())
    }
}

#[async_trait]
impl Destroyer for NullHandler {
    async fn destroy(&self, _ips: &IpSet) -> Result<(), LbError> {
        Ok(())
    }
}

/// The compute-provider surface the instance handler consumes.
#[async_trait]
pub trait ComputeProvider: Send + Sync + Debug {
    /// Map every requested IP to its instance id within the handler's
    /// region, `None` for IPs with no matching instance.
    async fn describe(&self, ips: &IpSet) -> Result<HashMap<String, Option<String>>, LbError>;

    /// Terminate instances by id.
    async fn terminate(&self, instance_ids: &[String]) -> Result<(), LbError>;
}

/// [`RegionFilter`] + [`Destroyer`] over a compute provider, with an
/// IP-to-instance cache.
#[derive(Debug)]
pub struct InstanceHandler {
    provider: Arc<dyn ComputeProvider>,
    /// IP -> instance id; `None` marks an IP known to have no instance
    /// in the region. Invalidated whenever a lookup is incomplete.
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl InstanceHandler {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve instance ids for `ips`, refreshing the cache when it does
    /// not cover every requested IP. Must be called with the cache lock
    /// held.
    async fn instance_ids(
        &self,
        cache: &mut HashMap<String, Option<String>>,
        ips: &IpSet,
    ) -> Result<Vec<String>, LbError> {
        if let Some(ids) = cached_ids(cache, ips) {
            return Ok(ids);
        }
        let described = self.provider.describe(ips).await?;
        debug!(requested = ips.len(), resolved = described.len(), "refreshed instance cache");
        *cache = described;
        cached_ids(cache, ips).ok_or_else(|| {
            LbError::Compute("provider response did not cover all requested IPs".to_string())
        })
    }
}

/// Returns `None` if the cache is missing any requested IP.
fn cached_ids(cache: &HashMap<String, Option<String>>, ips: &IpSet) -> Option<Vec<String>> {
    let mut ids = Vec::with_capacity(ips.len());
    for ip in ips {
        match cache.get(ip) {
            Some(Some(id)) => ids.push(id.clone()),
            Some(None) => {}
            None => return None,
        }
    }
    Some(ids)
}

#[async_trait]
impl RegionFilter for InstanceHandler {
    async fn filter(&self, ips: &IpSet) -> Result<IpSet, LbError> {
        let mut cache = self.cache.lock().await;
        self.instance_ids(&mut cache, ips).await?;
        Ok(ips
            .iter()
            .filter(|ip| matches!(cache.get(*ip), Some(Some(_))))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Destroyer for InstanceHandler {
    async fn destroy(&self, ips: &IpSet) -> Result<(), LbError> {
        let mut cache = self.cache.lock().await;
        let ids = self.instance_ids(&mut cache, ips).await?;
        if ids.is_empty() {
            return Ok(());
        }
        self.provider.terminate(&ids).await?;
        for ip in ips {
            cache.remove(ip);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Debug, Default)]
    struct FakeProvider {
        /// IP -> instance id in "the region"
        known: HashMap<String, String>,
        describe_calls: SyncMutex<u32>,
        terminated: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        async fn describe(
            &self,
            ips: &IpSet,
        ) -> Result<HashMap<String, Option<String>>, LbError> {
            *self.describe_calls.lock() += 1;
            Ok(ips
                .iter()
                .map(|ip| (ip.clone(), self.known.get(ip).cloned()))
                .collect())
        }

        async fn terminate(&self, instance_ids: &[String]) -> Result<(), LbError> {
            self.terminated.lock().extend_from_slice(instance_ids);
            Ok(())
        }
    }

    fn ips(list: &[&str]) -> IpSet {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn provider() -> Arc<FakeProvider> {
        let mut known = HashMap::new();
        known.insert("10.0.0.1".to_string(), "i-aaa".to_string());
        known.insert("10.0.0.2".to_string(), "i-bbb".to_string());
        Arc::new(FakeProvider {
            known,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_filter_drops_foreign_ips() {
        let handler = InstanceHandler::new(provider());
        let filtered = handler
            .filter(&ips(&["10.0.0.1", "10.0.0.2", "192.168.9.9"]))
            .await
            .unwrap();
        assert_eq!(filtered, ips(&["10.0.0.1", "10.0.0.2"]));
    }

    #[tokio::test]
    async fn test_cache_avoids_repeat_describes() {
        let provider = provider();
        let handler = InstanceHandler::new(provider.clone());
        let set = ips(&["10.0.0.1", "10.0.0.2"]);
        handler.filter(&set).await.unwrap();
        handler.filter(&set).await.unwrap();
        assert_eq!(*provider.describe_calls.lock(), 1);

        // A new IP makes the cache incomplete and forces a refresh.
        handler
            .filter(&ips(&["10.0.0.1", "10.0.0.3"]))
            .await
            .unwrap();
        assert_eq!(*provider.describe_calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_destroy_skips_unmatched_ips() {
        let provider = provider();
        let handler = InstanceHandler::new(provider.clone());
        handler
            .destroy(&ips(&["10.0.0.2", "192.168.9.9"]))
            .await
            .unwrap();
        assert_eq!(*provider.terminated.lock(), vec!["i-bbb".to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_invalidates_cache_entries() {
        let provider = provider();
        let handler = InstanceHandler::new(provider.clone());
        let set = ips(&["10.0.0.1"]);
        handler.filter(&set).await.unwrap();
        handler.destroy(&set).await.unwrap();
        // The destroyed IP is gone from the cache, so the next lookup
        // refreshes.
        handler.filter(&set).await.unwrap();
        assert_eq!(*provider.describe_calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_null_handler_passthrough() {
        let handler = NullHandler;
        let set = ips(&["10.0.0.1", "10.0.0.9"]);
        assert_eq!(handler.filter(&set).await.unwrap(), set);
        handler.destroy(&set).await.unwrap();
    }
}
