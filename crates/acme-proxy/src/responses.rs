//! The per-peer challenge response map.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

/// Maximum recorded paths per peer IP
pub const MAX_RESPONSES_PER_PEER: usize = 100;
/// Maximum size of one response body in bytes
pub const MAX_RESPONSE_SIZE: usize = 1 << 16;

/// Outcome of recording a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Body exceeds [`MAX_RESPONSE_SIZE`]
    TooLarge,
    /// Peer already holds [`MAX_RESPONSES_PER_PEER`] paths
    TooMany,
    /// Path already recorded for this peer
    Duplicate,
}

/// Two-level map: peer IP -> request path -> response body.
///
/// Public requests take the read lock, admin requests the write lock.
#[derive(Debug, Default)]
pub struct ResponseStore {
    ip_map: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl ResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one response for a peer.
    pub fn record(&self, peer_ip: &str, path: &str, body: Bytes) -> RecordOutcome {
        if body.len() > MAX_RESPONSE_SIZE {
            return RecordOutcome::TooLarge;
        }
        let mut ip_map = self.ip_map.write();
        let responses = ip_map.entry(peer_ip.to_string()).or_default();
        if responses.len() >= MAX_RESPONSES_PER_PEER {
            return RecordOutcome::TooMany;
        }
        if responses.contains_key(path) {
            return RecordOutcome::Duplicate;
        }
        responses.insert(path.to_string(), body);
        debug!(peer = %peer_ip, path = %path, "recorded challenge response");
        RecordOutcome::Recorded
    }

    /// Drop everything a peer recorded.
    pub fn cleanup(&self, peer_ip: &str) {
        self.ip_map.write().remove(peer_ip);
        debug!(peer = %peer_ip, "cleaned up challenge responses");
    }

    /// First recorded response for `path` among the candidate peers.
    pub fn lookup(&self, candidate_ips: &[String], path: &str) -> Option<Bytes> {
        let ip_map = self.ip_map.read();
        for ip in candidate_ips {
            if let Some(body) = ip_map.get(ip).and_then(|responses| responses.get(path)) {
                if !body.is_empty() {
                    return Some(body.clone());
                }
            }
        }
        None
    }

    /// Number of paths a peer currently holds.
    pub fn count(&self, peer_ip: &str) -> usize {
        self.ip_map
            .read()
            .get(peer_ip)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let store = ResponseStore::new();
        assert_eq!(
            store.record("1.2.3.4", "/.well-known/acme-challenge/tok", Bytes::from("body")),
            RecordOutcome::Recorded
        );
        let found = store.lookup(
            &["9.9.9.9".to_string(), "1.2.3.4".to_string()],
            "/.well-known/acme-challenge/tok",
        );
        assert_eq!(found, Some(Bytes::from("body")));
        assert!(store
            .lookup(&["9.9.9.9".to_string()], "/.well-known/acme-challenge/tok")
            .is_none());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let store = ResponseStore::new();
        store.record("1.2.3.4", "/p", Bytes::from("a"));
        assert_eq!(
            store.record("1.2.3.4", "/p", Bytes::from("b")),
            RecordOutcome::Duplicate
        );
        // Another peer may use the same path.
        assert_eq!(
            store.record("5.6.7.8", "/p", Bytes::from("c")),
            RecordOutcome::Recorded
        );
    }

    #[test]
    fn test_per_peer_limit() {
        let store = ResponseStore::new();
        for i in 0..MAX_RESPONSES_PER_PEER {
            assert_eq!(
                store.record("1.2.3.4", &format!("/p{}", i), Bytes::from("x")),
                RecordOutcome::Recorded
            );
        }
        assert_eq!(
            store.record("1.2.3.4", "/p-over", Bytes::from("x")),
            RecordOutcome::TooMany
        );
        assert_eq!(store.count("1.2.3.4"), MAX_RESPONSES_PER_PEER);
    }

    #[test]
    fn test_size_limit() {
        let store = ResponseStore::new();
        let body = Bytes::from(vec![b'x'; MAX_RESPONSE_SIZE + 1]);
        assert_eq!(store.record("1.2.3.4", "/p", body), RecordOutcome::TooLarge);
        let body = Bytes::from(vec![b'x'; MAX_RESPONSE_SIZE]);
        assert_eq!(store.record("1.2.3.4", "/p", body), RecordOutcome::Recorded);
    }

    #[test]
    fn test_cleanup_scoped_to_peer() {
        let store = ResponseStore::new();
        store.record("1.2.3.4", "/p", Bytes::from("a"));
        store.record("5.6.7.8", "/p", Bytes::from("b"));
        store.cleanup("1.2.3.4");
        assert_eq!(store.count("1.2.3.4"), 0);
        assert_eq!(store.count("5.6.7.8"), 1);
    }
}
