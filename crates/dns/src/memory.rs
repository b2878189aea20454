//! In-memory record store.
//!
//! Backs tests across the workspace and the daemon's dry-run mode. Unlike a
//! real provider it is immediately consistent, so `wait` is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use flotilla_common::{canonical_fqdn, RecordType};

use crate::store::{DnsResult, RecordStore};

type RecordKey = (String, RecordType);

/// A [`RecordStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordKey, (Vec<String>, Duration)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of record-sets currently stored.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Seed a record-set directly, bypassing the trait.
    pub fn seed(&self, fqdn: &str, rtype: RecordType, values: &[&str], ttl: Duration) {
        self.records.lock().insert(
            (canonical_fqdn(fqdn), rtype),
            (values.iter().map(|v| v.to_string()).collect(), ttl),
        );
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
    ) -> DnsResult<(Vec<String>, Duration)> {
        let key = (canonical_fqdn(fqdn), rtype);
        Ok(self
            .records
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or((Vec::new(), Duration::ZERO)))
    }

    async fn write_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
        values: &[String],
        ttl: Duration,
        _wait: bool,
    ) -> DnsResult<()> {
        let key = (canonical_fqdn(fqdn), rtype);
        self.records.lock().insert(key, (values.to_vec(), ttl));
        Ok(())
    }

    async fn delete_records(&self, fqdn: &str, rtype: RecordType) -> DnsResult<()> {
        let key = (canonical_fqdn(fqdn), rtype);
        self.records.lock().remove(&key);
        Ok(())
    }
}
