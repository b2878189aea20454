//! The record store capability and its error taxonomy.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use flotilla_common::RecordType;

/// Result type for record store operations
pub type DnsResult<T> = Result<T, RecordStoreError>;

/// Errors that can occur against a DNS provider
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// Authentication failed with the DNS provider
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Zone not found for the name
    #[error("zone not found for '{fqdn}'")]
    ZoneNotFound { fqdn: String },

    /// Record write failed
    #[error("failed to write {rtype} records for '{fqdn}': {message}")]
    RecordWrite {
        fqdn: String,
        rtype: RecordType,
        message: String,
    },

    /// Record deletion failed
    #[error("failed to delete {rtype} records for '{fqdn}': {message}")]
    RecordDelete {
        fqdn: String,
        rtype: RecordType,
        message: String,
    },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Rate limited by provider
    #[error("rate limited by DNS provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timeout
    #[error("request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// A DNS record store.
///
/// Implementations must be thread-safe; the load-balancer controller, the
/// blocked-record machinery and the DNS-01 responder may all hold the same
/// store at once.
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Read all records of `rtype` at `fqdn`.
    ///
    /// Returns the unquoted values and the record TTL. An absent record-set
    /// is an empty list, not an error.
    async fn read_records(&self, fqdn: &str, rtype: RecordType)
        -> DnsResult<(Vec<String>, Duration)>;

    /// Replace the entire record-set of `rtype` at `fqdn`.
    ///
    /// When `wait` is set the call blocks until the change is confirmed
    /// visible, bounded by a two-minute timeout after which the write is
    /// treated as successful.
    async fn write_records(
        &self,
        fqdn: &str,
        rtype: RecordType,
        values: &[String],
        ttl: Duration,
        wait: bool,
    ) -> DnsResult<()>;

    /// Delete every record of `rtype` at `fqdn`. Deleting an absent
    /// record-set is not an error.
    async fn delete_records(&self, fqdn: &str, rtype: RecordType) -> DnsResult<()>;
}

/// Insert double quotes if missing. TXT values travel quoted on the wire.
pub fn quote_txt(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value.to_string()
    } else {
        format!("\"{}\"", value)
    }
}

/// Strip double quotes if present.
pub fn unquote_txt(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_txt() {
        assert_eq!(quote_txt("abc"), "\"abc\"");
        assert_eq!(quote_txt("\"abc\""), "\"abc\"");
        assert_eq!(quote_txt(""), "\"\"");
    }

    #[test]
    fn test_unquote_txt() {
        assert_eq!(unquote_txt("\"abc\""), "abc");
        assert_eq!(unquote_txt("abc"), "abc");
        assert_eq!(unquote_txt("\""), "\"");
        assert_eq!(unquote_txt("\"\""), "");
    }

    #[test]
    fn test_quote_roundtrip() {
        for value in ["IP=10.0.0.1", "OwnerExpires=2026-08-02T10:00:00Z", "x"] {
            assert_eq!(unquote_txt(&quote_txt(value)), value);
        }
    }
}
