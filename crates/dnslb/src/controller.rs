//! The per-instance load balancer controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use flotilla_common::jitter::spread_interval;
use flotilla_common::RecordType;
use flotilla_config::LbConfig;
use flotilla_dns::RecordStore;

use crate::blocked::check_blocked;
use crate::error::LbError;
use crate::instances::{Destroyer, IpSet, RegionFilter};
use crate::probe::probe_peers;

/// The capabilities a controller acts through.
pub struct LbParams {
    pub store: Arc<dyn RecordStore>,
    pub region_filter: Arc<dyn RegionFilter>,
    pub destroyer: Arc<dyn Destroyer>,
}

/// One instance's controller: probes peers, updates the shared A
/// record-set, self-registers, and escalates persistent failures to the
/// instance destroyer.
pub struct LoadBalancer {
    config: LbConfig,
    params: LbParams,
    my_ip: String,
    /// Consecutive probe failures per peer IP. Only the controller task
    /// mutates this.
    failures: Mutex<HashMap<String, u32>>,
}

impl LoadBalancer {
    /// Create a controller and start its probe loop.
    pub fn spawn(config: LbConfig, params: LbParams, my_ip: String) -> Result<Arc<Self>, LbError> {
        let lb = Self::new(config, params, my_ip)?;
        let looped = lb.clone();
        tokio::spawn(async move {
            looped.run().await;
        });
        Ok(lb)
    }

    /// Create a controller without starting the loop; drive it with
    /// [`tick`].
    ///
    /// [`tick`]: LoadBalancer::tick
    pub fn new(config: LbConfig, params: LbParams, my_ip: String) -> Result<Arc<Self>, LbError> {
        if config.fqdn.is_empty() {
            return Err(LbError::Configuration("no FQDN specified".into()));
        }
        if config.tcp_port == 0 {
            return Err(LbError::Configuration("no TCP port number specified".into()));
        }
        if my_ip.is_empty() {
            return Err(LbError::Configuration("no instance IP specified".into()));
        }
        Ok(Arc::new(Self {
            config,
            params,
            my_ip,
            failures: Mutex::new(HashMap::new()),
        }))
    }

    async fn run(self: Arc<Self>) {
        info!(fqdn = %self.config.fqdn, my_ip = %self.my_ip, "starting DNS load balancer");
        loop {
            if let Err(e) = self.tick().await {
                error!(fqdn = %self.config.fqdn, error = %e, "load balancer check failed");
            }
            tokio::time::sleep(spread_interval(self.config.check_interval())).await;
        }
    }

    /// One probe/update round. Normally driven by the internal loop.
    pub async fn tick(&self) -> Result<(), LbError> {
        let interval = self.config.check_interval();
        let (check_list, _) = self
            .params
            .store
            .read_records(&self.config.fqdn, RecordType::A)
            .await?;
        let start = Instant::now();
        debug!(fqdn = %self.config.fqdn, ips = ?check_list, "read A record-set");

        let mut peers: IpSet = check_list.iter().cloned().collect();
        let self_present = peers.remove(&self.my_ip);

        let failing = probe_peers(&peers, self.config.tcp_port, self.config.do_tls, interval / 4)
            .await;

        let ejection = self.update_failures(&peers, &failing);
        let ejection = self.apply_region_filter(ejection).await?;

        if !ejection.is_empty() {
            info!(fqdn = %self.config.fqdn, ips = ?ejection, "destroying failed peers");
            if let Err(e) = self.params.destroyer.destroy(&ejection).await {
                warn!(error = %e, "destroyer failed, will retry next tick");
            }
        }

        // Fast path: a healthy steady state needs no second read and no
        // write.
        if self_present && failing.is_empty() && start.elapsed() < interval / 16 {
            debug!(fqdn = %self.config.fqdn, "no DNS changes (fast check)");
            return Ok(());
        }

        let (old_list, _) = self
            .params
            .store
            .read_records(&self.config.fqdn, RecordType::A)
            .await?;
        let mut new_list: Vec<String> = Vec::with_capacity(old_list.len() + 1);
        let mut found_self = false;
        for ip in &old_list {
            if *ip == self.my_ip {
                new_list.push(ip.clone());
                found_self = true;
            } else if !ejection.contains(ip) {
                new_list.push(ip.clone());
            }
        }
        if !found_self {
            match check_blocked(&self.params.store, &self.config.fqdn, &self.my_ip).await? {
                Some(remaining) => {
                    info!(
                        fqdn = %self.config.fqdn,
                        my_ip = %self.my_ip,
                        remaining = ?remaining,
                        "not adding self to DNS, blocked"
                    );
                }
                None => {
                    info!(fqdn = %self.config.fqdn, my_ip = %self.my_ip, "adding my IP to DNS");
                    new_list.push(self.my_ip.clone());
                }
            }
        }

        let old_set: IpSet = old_list.iter().cloned().collect();
        let new_set: IpSet = new_list.iter().cloned().collect();
        if old_set == new_set {
            debug!(fqdn = %self.config.fqdn, "no DNS changes");
            return Ok(());
        }
        info!(fqdn = %self.config.fqdn, ips = ?new_list, "updating A record-set");
        self.params
            .store
            .write_records(&self.config.fqdn, RecordType::A, &new_list, interval, false)
            .await?;
        Ok(())
    }

    /// Update per-peer failure counters and return the ejection
    /// candidates (counter at the minimum threshold).
    fn update_failures(&self, peers: &IpSet, failing: &IpSet) -> IpSet {
        let mut failures = self.failures.lock();
        // Forget counters for IPs no longer in DNS.
        failures.retain(|ip, _| peers.contains(ip));
        for ip in peers {
            if failing.contains(ip) {
                *failures.entry(ip.clone()).or_insert(0) += 1;
            } else {
                failures.remove(ip);
            }
        }
        failures
            .iter()
            .filter(|(_, count)| **count >= self.config.minimum_failures)
            .map(|(ip, _)| ip.clone())
            .collect()
    }

    /// Scope candidates to this controller's region. A peer past the
    /// maximum failure threshold is ejected regardless of the filter.
    async fn apply_region_filter(&self, candidates: IpSet) -> Result<IpSet, LbError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let mut ejection = self.params.region_filter.filter(&candidates).await?;
        let failures = self.failures.lock();
        for ip in &candidates {
            if failures.get(ip).copied().unwrap_or(0) > self.config.maximum_failures {
                ejection.insert(ip.clone());
            }
        }
        Ok(ejection)
    }
}

/// Best-effort detection of this instance's outbound IP: the local
/// address of a routed (never sent) UDP association.
pub fn detect_my_ip() -> std::io::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("198.51.100.1:53")?;
    Ok(socket.local_addr()?.ip().to_string())
}
