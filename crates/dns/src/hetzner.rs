//! Hetzner DNS record store.
//!
//! Talks to the Hetzner DNS API to manage whole record-sets. Because the
//! API stores one record per value, a record-set write deletes every
//! existing record of the name/type pair and recreates one record per
//! value.
//!
//! API documentation: <https://dns.hetzner.com/api-docs>

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use flotilla_common::{canonical_fqdn, RecordType};

use crate::propagation::{PropagationChecker, PropagationConfig};
use crate::store::{quote_txt, unquote_txt, DnsResult, RecordStore, RecordStoreError};

/// Hetzner DNS API base URL
const HETZNER_API_BASE: &str = "https://dns.hetzner.com/api/v1";

/// Hetzner-backed [`RecordStore`].
#[derive(Debug)]
pub struct HetznerRecordStore {
    client: Client,
    token: String,
    zone: String,
    /// Lazily resolved zone id
    zone_id: RwLock<Option<String>>,
    checker: PropagationChecker,
}

impl HetznerRecordStore {
    /// Create a store for one zone.
    ///
    /// `zone` is the zone name as registered with Hetzner (no trailing
    /// dot); every FQDN passed to this store must live in that zone.
    pub fn new(zone: &str, token: &str, timeout: Duration) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            RecordStoreError::Configuration(format!("failed to create HTTP client: {}", e))
        })?;
        let checker = PropagationChecker::with_config(PropagationConfig::default())?;
        Ok(Self {
            client,
            token: token.to_string(),
            zone: zone.trim_end_matches('.').to_string(),
            zone_id: RwLock::new(None),
            checker,
        })
    }

    async fn zone_id(&self) -> DnsResult<String> {
        if let Some(id) = self.zone_id.read().clone() {
            trace!(zone = %self.zone, zone_id = %id, "zone id found in cache");
            return Ok(id);
        }

        let response = self
            .client
            .get(format!("{}/zones", HETZNER_API_BASE))
            .query(&[("name", self.zone.as_str())])
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RecordStoreError::Authentication(
                "invalid Hetzner API token".to_string(),
            ));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::ApiRequest(format!(
                "failed to list zones: HTTP {} - {}",
                status, body
            )));
        }

        let zones: ZonesResponse = response
            .json()
            .await
            .map_err(|e| RecordStoreError::ApiRequest(format!("failed to parse zones: {}", e)))?;
        let zone = zones
            .zones
            .into_iter()
            .find(|z| z.name == self.zone)
            .ok_or_else(|| RecordStoreError::ZoneNotFound {
                fqdn: self.zone.clone(),
            })?;

        debug!(zone = %self.zone, zone_id = %zone.id, "resolved zone id");
        *self.zone_id.write() = Some(zone.id.clone());
        Ok(zone.id)
    }

    /// Record name relative to the zone: "@" for the apex.
    fn relative_name(&self, fqdn: &str) -> DnsResult<String> {
        let fqdn = canonical_fqdn(fqdn);
        let apex = format!("{}.", self.zone);
        if fqdn == apex {
            return Ok("@".to_string());
        }
        fqdn.strip_suffix(&format!(".{}", apex))
            .map(|stripped| stripped.to_string())
            .ok_or_else(|| RecordStoreError::ZoneNotFound { fqdn })
    }

    /// List the records matching name/type in the zone.
    async fn list_matching(
        &self,
        fqdn: &str,
        rtype: RecordType,
    ) -> DnsResult<Vec<HetznerRecord>> {
        let zone_id = self.zone_id().await?;
        let name = self.relative_name(fqdn)?;

        let response = self
            .client
            .get(format!("{}/records", HETZNER_API_BASE))
            .query(&[("zone_id", zone_id.as_str())])
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::ApiRequest(format!(
                "failed to list records: HTTP {} - {}",
                status, body
            )));
        }

        let records: RecordsResponse = response
            .json()
            .await
            .map_err(|e| RecordStoreError::ApiRequest(format!("failed to parse records: {}", e)))?;

        Ok(records
            .records
            .into_iter()
            .filter(|r| r.name == name && r.r#type == rtype.as_str())
            .collect())
    }

    async fn create_record(
        &self,
        fqdn: &str,
        rtype: RecordType,
        value: &str,
        ttl: Duration,
    ) -> DnsResult<()> {
        let zone_id = self.zone_id().await?;
        let name = self.relative_name(fqdn)?;
        let request = CreateRecordRequest {
            zone_id,
            name,
            r#type: rtype.as_str().to_string(),
            value: value.to_string(),
            ttl: Some(ttl.as_secs()),
        };

        let response = self
            .client
            .post(format!("{}/records", HETZNER_API_BASE))
            .header("Auth-API-Token", &self.token)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::RecordWrite {
                fqdn: fqdn.to_string(),
                rtype,
                message: format!("HTTP {} - {}", status, body),
            });
        }
        Ok(())
    }

    async fn delete_record(&self, fqdn: &str, rtype: RecordType, record_id: &str) -> DnsResult<()> {
        let response = self
            .client
            .delete(format!("{}/records/{}", HETZNER_API_BASE, record_id))
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        // Deleting a record that is already gone is fine.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::RecordDelete {
                fqdn: fqdn.to_string(),
                rtype,
                message: format!("HTTP {} - {}", status, body),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for HetznerRecordStore {
    async fn read_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
    ) -> DnsResult<(Vec<String>, Duration)> {
        let matching = self.list_matching(fqdn, rtype).await?;
        let mut ttl = Duration::ZERO;
        let mut values = Vec::with_capacity(matching.len());
        for record in matching {
            if let Some(record_ttl) = record.ttl {
                ttl = ttl.max(Duration::from_secs(record_ttl));
            }
            values.push(match rtype {
                RecordType::Txt => unquote_txt(&record.value),
                RecordType::A => record.value,
            });
        }
        Ok((values, ttl))
    }

    async fn write_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
        values: &[String],
        ttl: Duration,
        wait: bool,
    ) -> DnsResult<()> {
        // Replace, never append: drop the existing set first.
        let existing = self.list_matching(fqdn, rtype).await?;
        for record in &existing {
            self.delete_record(fqdn, rtype, &record.id).await?;
        }
        for value in values {
            let wire_value = match rtype {
                RecordType::Txt => quote_txt(value),
                RecordType::A => value.clone(),
            };
            self.create_record(fqdn, rtype, &wire_value, ttl).await?;
        }
        debug!(fqdn = %fqdn, rtype = %rtype, count = values.len(), "record-set replaced");

        if wait {
            let fqdn = canonical_fqdn(fqdn);
            match self.checker.wait_for_records(&fqdn, rtype, values).await {
                Ok(()) => {}
                Err(RecordStoreError::Timeout { elapsed_secs }) => {
                    warn!(
                        fqdn = %fqdn,
                        elapsed_secs,
                        "timed out waiting for record change, hoping for the best"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn delete_records(&self, fqdn: &str, rtype: RecordType) -> DnsResult<()> {
        let existing = self.list_matching(fqdn, rtype).await?;
        for record in existing {
            self.delete_record(fqdn, rtype, &record.id).await?;
        }
        Ok(())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RecordStoreError {
    if e.is_timeout() {
        RecordStoreError::Timeout { elapsed_secs: 30 }
    } else {
        RecordStoreError::ApiRequest(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<HetznerRecord>,
}

#[derive(Debug, Deserialize)]
struct HetznerRecord {
    id: String,
    name: String,
    r#type: String,
    value: String,
    ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest {
    zone_id: String,
    name: String,
    r#type: String,
    value: String,
    ttl: Option<u64>,
}
