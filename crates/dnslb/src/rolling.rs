//! Operator action: rolling replacement of every regional instance.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use flotilla_common::RecordType;
use flotilla_config::LbConfig;

use crate::blocked::{check_blocked, cleanup_block, new_owner_id, write_block};
use crate::controller::LbParams;
use crate::error::LbError;
use crate::instances::IpSet;
use crate::probe::probe_peers;

/// Replace every instance of this region, one at a time.
///
/// For each regional IP: acquire the `_blocked` lock with that IP's
/// veto, drop the IP from the A record-set, wait out the TTL, destroy
/// the instance, then poll until the regional set is back to strength
/// and every member passes a probe. External machinery (autoscaling, an
/// orchestrator) is expected to start replacements that self-register.
///
/// Safe to re-run after a crash: the abandoned `_blocked` record expires
/// on its own.
pub async fn rolling_replace(config: &LbConfig, params: &LbParams) -> Result<(), LbError> {
    let (regional, ttl) = regional_ips(config, params).await?;
    let ttl = if ttl.is_zero() {
        config.check_interval()
    } else {
        ttl
    };

    for ip in &regional {
        if check_blocked(&params.store, &config.fqdn, ip).await?.is_some() {
            warn!(ip = %ip, "IP is blocked");
            return Err(LbError::ReplaceActive);
        }
    }
    info!(fqdn = %config.fqdn, ips = ?regional, "regional IPs");
    if regional.len() < 2 {
        return Err(LbError::NoQuorum {
            found: regional.len(),
        });
    }

    let owner_id = new_owner_id();
    let required = regional.len();
    for ip in &regional {
        replace_one(config, params, &owner_id, ip, ttl, required).await?;
    }
    cleanup_block(&params.store, &config.fqdn).await
}

/// The A record-set filtered to this controller's region, plus its TTL.
async fn regional_ips(config: &LbConfig, params: &LbParams) -> Result<(IpSet, Duration), LbError> {
    let (list, ttl) = params
        .store
        .read_records(&config.fqdn, RecordType::A)
        .await?;
    let all: IpSet = list.into_iter().collect();
    let regional = params.region_filter.filter(&all).await?;
    Ok((regional, ttl))
}

async fn replace_one(
    config: &LbConfig,
    params: &LbParams,
    owner_id: &str,
    ip: &str,
    ttl: Duration,
    required: usize,
) -> Result<(), LbError> {
    let drain_ttl = ttl.min(Duration::from_secs(5));

    // Grab the lock and veto the instance's self-registration.
    write_block(&params.store, &config.fqdn, owner_id, Some(ip), ttl).await?;

    // Drain: rewrite the record-set without the instance.
    let (old_list, _) = params
        .store
        .read_records(&config.fqdn, RecordType::A)
        .await?;
    let new_list: Vec<String> = old_list.into_iter().filter(|old| old != ip).collect();
    params
        .store
        .write_records(&config.fqdn, RecordType::A, &new_list, drain_ttl, false)
        .await?;
    info!(ip = %ip, fqdn = %config.fqdn, "removed instance from DNS");

    // Let resolver caches expire before the instance goes away.
    info!(ip = %ip, wait = ?ttl, "sleeping before destroying instance");
    tokio::time::sleep(ttl).await;

    let mut target = IpSet::new();
    target.insert(ip.to_string());
    params.destroyer.destroy(&target).await?;
    info!(ip = %ip, "destroyed instance, waiting for replacement");

    // Wait for the region to be back at strength, keeping the lock
    // fresh while we wait.
    loop {
        tokio::time::sleep(ttl / 4).await;
        write_block(&params.store, &config.fqdn, owner_id, None, ttl).await?;
        let (regional, _) = regional_ips(config, params).await?;
        if regional.len() < required {
            info!(
                registered = regional.len(),
                required, "waiting for instances to register"
            );
            continue;
        }
        let failing = probe_peers(
            &regional,
            config.tcp_port,
            config.do_tls,
            config.check_interval() / 4,
        )
        .await;
        if failing.is_empty() {
            break;
        }
        info!(ips = ?failing, "waiting for unhealthy instances");
    }
    Ok(())
}
