//! The `_blocked.<fqdn>` coordination record.
//!
//! A multi-valued TXT record of `key=value` pairs. While unexpired,
//! `OwnerId` holds the exclusive rolling-replace lock; `IP` plus
//! `IpExpires` vetoes that IP's self-registration. A record that fails to
//! parse, or whose owner has expired, is deleted and treated as absent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use flotilla_common::RecordType;
use flotilla_dns::RecordStore;

use crate::error::LbError;

/// Parsed contents of a `_blocked` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRecord {
    /// IP barred from self-registration, if any
    pub ip: Option<String>,
    /// When the IP veto lapses
    pub ip_expires: Option<DateTime<Utc>>,
    /// 4-byte random hex id of the operator holding the lock
    pub owner_id: String,
    /// When the lock lapses
    pub owner_expires: DateTime<Utc>,
}

pub(crate) fn blocked_fqdn(fqdn: &str) -> String {
    format!("_blocked.{}", fqdn)
}

/// Parse the TXT values of a blocked record.
///
/// Returns `Ok(None)` for an absent record. Every malformation is an
/// error; callers delete the record and continue as if absent.
pub(crate) fn parse_blocked(txts: &[String]) -> Result<Option<BlockedRecord>, String> {
    if txts.is_empty() {
        return Ok(None);
    }
    if txts.len() < 2 {
        return Err("wrong number of values".to_string());
    }
    let mut ip = None;
    let mut ip_expires = None;
    let mut owner_id = None;
    let mut owner_expires = None;
    for txt in txts {
        let txt = txt.trim();
        let (key, value) = txt
            .split_once('=')
            .ok_or_else(|| format!("bad split for: {}", txt))?;
        match (key.trim(), value.trim()) {
            ("IP", value) => ip = Some(value.to_string()),
            ("IpExpires", value) => {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| format!("bad IpExpires: {}", e))?;
                ip_expires = Some(parsed.with_timezone(&Utc));
            }
            ("OwnerId", value) => owner_id = Some(value.to_string()),
            ("OwnerExpires", value) => {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| format!("bad OwnerExpires: {}", e))?;
                owner_expires = Some(parsed.with_timezone(&Utc));
            }
            _ => {}
        }
    }
    let owner_id = owner_id.ok_or_else(|| "no OwnerId specified".to_string())?;
    let owner_expires =
        owner_expires.ok_or_else(|| "no owner expiration time specified".to_string())?;
    if owner_expires <= Utc::now() {
        return Err("expired owner".to_string());
    }
    Ok(Some(BlockedRecord {
        ip,
        ip_expires,
        owner_id,
        owner_expires,
    }))
}

/// Read and parse the blocked record; a malformed record is deleted and
/// reported as absent.
pub(crate) async fn get_blocked(
    store: &Arc<dyn RecordStore>,
    fqdn: &str,
) -> Result<Option<BlockedRecord>, LbError> {
    let blocked_name = blocked_fqdn(fqdn);
    let (txts, _) = store.read_records(&blocked_name, RecordType::Txt).await?;
    match parse_blocked(&txts) {
        Ok(blocked) => Ok(blocked),
        Err(reason) => {
            store.delete_records(&blocked_name, RecordType::Txt).await?;
            warn!(fqdn = %blocked_name, reason = %reason, "deleted malformed blocked record");
            Ok(None)
        }
    }
}

/// Write the blocked record: the owner lock, plus an IP veto when `ip`
/// is given. Refuses while another owner's unexpired record exists.
pub(crate) async fn write_block(
    store: &Arc<dyn RecordStore>,
    fqdn: &str,
    owner_id: &str,
    ip: Option<&str>,
    ttl: Duration,
) -> Result<(), LbError> {
    if let Some(existing) = get_blocked(store, fqdn).await? {
        if existing.owner_id != owner_id {
            return Err(LbError::BlockedByOther {
                owner: existing.owner_id,
            });
        }
    }
    let now = Utc::now();
    let mut txts = Vec::with_capacity(4);
    let ip_interval = ttl * 2;
    if let Some(ip) = ip {
        txts.push(format!("IP={}", ip));
        txts.push(format!(
            "IpExpires={}",
            (now + ip_interval).to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    txts.push(format!("OwnerId={}", owner_id));
    txts.push(format!(
        "OwnerExpires={}",
        (now + ttl * 5).to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    store
        .write_records(&blocked_fqdn(fqdn), RecordType::Txt, &txts, ttl, false)
        .await?;
    match ip {
        Some(ip) => info!(ip = %ip, veto = ?ip_interval, "blocked IP from self-registration"),
        None => info!(lock = ?(ttl * 5), "refreshed replace lock"),
    }
    Ok(())
}

/// How much longer `ip` is vetoed, if at all.
pub(crate) async fn check_blocked(
    store: &Arc<dyn RecordStore>,
    fqdn: &str,
    ip: &str,
) -> Result<Option<Duration>, LbError> {
    let Some(blocked) = get_blocked(store, fqdn).await? else {
        return Ok(None);
    };
    if blocked.ip.as_deref() != Some(ip) {
        return Ok(None);
    }
    let Some(ip_expires) = blocked.ip_expires else {
        return Ok(None);
    };
    let remaining = ip_expires - Utc::now();
    Ok(remaining.to_std().ok())
}

/// Delete the blocked record.
pub(crate) async fn cleanup_block(
    store: &Arc<dyn RecordStore>,
    fqdn: &str,
) -> Result<(), LbError> {
    let blocked_name = blocked_fqdn(fqdn);
    store.delete_records(&blocked_name, RecordType::Txt).await?;
    info!(fqdn = %blocked_name, "cleaned up blocked record");
    Ok(())
}

/// A fresh 4-byte random owner id.
pub(crate) fn new_owner_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future(minutes: i64) -> String {
        (Utc::now() + chrono::Duration::minutes(minutes))
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn vals(list: &[String]) -> Vec<String> {
        list.to_vec()
    }

    #[test]
    fn test_parse_absent() {
        assert_eq!(parse_blocked(&[]).unwrap(), None);
    }

    #[test]
    fn test_parse_full_record() {
        let txts = vals(&[
            "IP=10.0.0.1".to_string(),
            format!("IpExpires={}", future(2)),
            "OwnerId=cafe0123".to_string(),
            format!("OwnerExpires={}", future(5)),
        ]);
        let blocked = parse_blocked(&txts).unwrap().unwrap();
        assert_eq!(blocked.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(blocked.owner_id, "cafe0123");
        assert!(blocked.ip_expires.is_some());
    }

    #[test]
    fn test_parse_owner_only_record() {
        let txts = vals(&[
            "OwnerId=cafe0123".to_string(),
            format!("OwnerExpires={}", future(5)),
        ]);
        let blocked = parse_blocked(&txts).unwrap().unwrap();
        assert!(blocked.ip.is_none());
        assert!(blocked.ip_expires.is_none());
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        let txts = vals(&[
            "  OwnerId = cafe0123 ".to_string(),
            format!(" OwnerExpires = {}", future(5)),
        ]);
        let blocked = parse_blocked(&txts).unwrap().unwrap();
        assert_eq!(blocked.owner_id, "cafe0123");
    }

    #[test]
    fn test_parse_rejects_malformations() {
        // Single value.
        assert!(parse_blocked(&vals(&["OwnerId=x".to_string()])).is_err());
        // No '='.
        assert!(parse_blocked(&vals(&[
            "gibberish".to_string(),
            "OwnerId=x".to_string()
        ]))
        .is_err());
        // Missing owner.
        assert!(parse_blocked(&vals(&[
            "IP=10.0.0.1".to_string(),
            format!("IpExpires={}", future(2)),
        ]))
        .is_err());
        // Missing owner expiry.
        assert!(parse_blocked(&vals(&[
            "OwnerId=x".to_string(),
            "IP=10.0.0.1".to_string()
        ]))
        .is_err());
        // Expired owner.
        assert!(parse_blocked(&vals(&[
            "OwnerId=x".to_string(),
            format!("OwnerExpires={}", future(-1)),
        ]))
        .is_err());
        // Bad timestamp.
        assert!(parse_blocked(&vals(&[
            "OwnerId=x".to_string(),
            "OwnerExpires=yesterday".to_string()
        ]))
        .is_err());
    }

    #[test]
    fn test_owner_id_shape() {
        let id = new_owner_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_malformed_record_is_deleted() {
        use flotilla_dns::MemoryRecordStore;

        let memory = Arc::new(MemoryRecordStore::new());
        memory.seed(
            "_blocked.lb.example.com",
            RecordType::Txt,
            &["OwnerId=x", "OwnerExpires=yesterday"],
            Duration::from_secs(60),
        );
        let store: Arc<dyn RecordStore> = memory.clone();
        assert!(get_blocked(&store, "lb.example.com").await.unwrap().is_none());
        assert!(memory.is_empty());
    }
}
