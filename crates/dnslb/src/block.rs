//! Operator action: temporarily block one IP from self-registration.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use flotilla_dns::RecordStore;

use crate::blocked::{cleanup_block, new_owner_id, write_block};
use crate::error::LbError;

/// Refresh period for the blocked record while the block is active
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Block `ip` from re-registering under `fqdn` for `duration`.
///
/// The blocked record is rewritten every minute so a crashed operator
/// leaves only a short-lived veto behind. A message on `cancel` ends the
/// block early; either way the record is deleted on the way out.
pub async fn block(
    store: Arc<dyn RecordStore>,
    fqdn: &str,
    ip: &str,
    duration: Duration,
    mut cancel: mpsc::Receiver<()>,
) -> Result<(), LbError> {
    if duration < Duration::from_secs(60) {
        return Err(LbError::BadDuration(format!("{:?} is under a minute", duration)));
    }
    if duration > Duration::from_secs(3600) {
        return Err(LbError::BadDuration(format!("{:?} is over an hour", duration)));
    }

    let owner_id = new_owner_id();
    let stop_at = tokio::time::Instant::now() + duration;
    info!(fqdn = %fqdn, ip = %ip, owner_id = %owner_id, duration = ?duration, "blocking IP");

    while tokio::time::Instant::now() < stop_at {
        write_block(&store, fqdn, &owner_id, Some(ip), REFRESH_INTERVAL).await?;
        tokio::select! {
            _ = cancel.recv() => {
                info!(fqdn = %fqdn, ip = %ip, "block cancelled");
                break;
            }
            _ = tokio::time::sleep_until(stop_at.min(tokio::time::Instant::now() + REFRESH_INTERVAL)) => {}
        }
    }
    cleanup_block(&store, fqdn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::RecordType;
    use flotilla_dns::MemoryRecordStore;

    #[tokio::test]
    async fn test_duration_bounds() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let (_tx, rx) = mpsc::channel(1);
        let err = block(store.clone(), "lb.example.com", "10.0.0.1", Duration::from_secs(10), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::BadDuration(_)));

        let (_tx, rx) = mpsc::channel(1);
        let err = block(store, "lb.example.com", "10.0.0.1", Duration::from_secs(7200), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::BadDuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_refreshes_and_cleans_up() {
        let memory = Arc::new(MemoryRecordStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let (_tx, rx) = mpsc::channel(1);

        block(store.clone(), "lb.example.com", "10.0.0.1", Duration::from_secs(120), rx)
            .await
            .unwrap();

        let (txts, _) = store
            .read_records("_blocked.lb.example.com", RecordType::Txt)
            .await
            .unwrap();
        assert!(txts.is_empty(), "blocked record must be deleted on completion");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_early() {
        let memory = Arc::new(MemoryRecordStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(block(
            store.clone(),
            "lb.example.com",
            "10.0.0.1",
            Duration::from_secs(3600),
            rx,
        ));
        // Let the first write land, then cancel.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (txts, _) = store
            .read_records("_blocked.lb.example.com", RecordType::Txt)
            .await
            .unwrap();
        assert!(txts.iter().any(|t| t == "IP=10.0.0.1"));

        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        let (txts, _) = store
            .read_records("_blocked.lb.example.com", RecordType::Txt)
            .await
            .unwrap();
        assert!(txts.is_empty());
    }
}
