//! The challenge responder capability.

use async_trait::async_trait;

use crate::error::ResponderError;

/// Publishes ACME challenge responses.
///
/// For http-01 the key is the full request path
/// (`/.well-known/acme-challenge/<token>`) and the value the expected
/// body; for dns-01 the key is the challenge FQDN
/// (`_acme-challenge.<domain>`) and the value the token digest.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Publish one challenge response. Publishing the same key/value twice
    /// is a no-op.
    async fn respond(&self, key: &str, value: &str) -> Result<(), ResponderError>;

    /// Drop every published response and remove external state (DNS
    /// records, proxy entries). Failures are logged, not returned: cleanup
    /// runs on both success and failure paths of an order.
    async fn cleanup(&self);
}
