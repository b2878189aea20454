//! dns-01 responder over a record store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use flotilla_common::RecordType;
use flotilla_dns::RecordStore;

use crate::error::ResponderError;
use crate::responder::Responder;

/// TTL for challenge TXT records
const CHALLENGE_TTL: Duration = Duration::from_secs(15);

/// dns-01 responder writing `_acme-challenge.<domain>` TXT records.
pub struct DnsResponder {
    store: Arc<dyn RecordStore>,
    /// FQDNs written during the current order, with their values
    records: Mutex<HashMap<String, String>>,
}

impl DnsResponder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Responder for DnsResponder {
    async fn respond(&self, key: &str, value: &str) -> Result<(), ResponderError> {
        if self.records.lock().get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        debug!(fqdn = %key, value = %value, "publishing challenge TXT record");
        self.store
            .write_records(key, RecordType::Txt, &[value.to_string()], CHALLENGE_TTL, true)
            .await?;
        self.records
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn cleanup(&self) {
        let fqdns: Vec<String> = self.records.lock().keys().cloned().collect();
        for fqdn in fqdns {
            match self.store.delete_records(&fqdn, RecordType::Txt).await {
                Ok(()) => {
                    self.records.lock().remove(&fqdn);
                }
                Err(e) => warn!(fqdn = %fqdn, error = %e, "failed to remove challenge record"),
            }
        }
    }
}
