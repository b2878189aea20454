//! http-01 responder that publishes through an ACME proxy.
//!
//! Instances without a public port 80 of their own delegate challenge
//! serving to a cluster-scoped proxy (see the `flotilla-acme-proxy`
//! crate). `respond` records one path/body pair under this instance's IP;
//! `cleanup` drops everything the instance recorded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

use flotilla_common::api::{ACME_PATH, PROXY_CLEANUP_RESPONSES, PROXY_RECORD_RESPONSE};

use crate::error::{CertError, ResponderError};
use crate::responder::Responder;

/// http-01 responder publishing to an ACME proxy admin surface.
#[derive(Debug)]
pub struct ProxyResponder {
    client: Client,
    /// "host:port" of the proxy admin surface
    proxy: String,
}

impl ProxyResponder {
    pub fn new(proxy: impl Into<String>) -> Result<Self, CertError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| CertError::Configuration(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            proxy: proxy.into(),
        })
    }
}

#[async_trait]
impl Responder for ProxyResponder {
    async fn respond(&self, key: &str, value: &str) -> Result<(), ResponderError> {
        if !key.starts_with(ACME_PATH) {
            return Err(ResponderError::NotAcmeChallenge(key.to_string()));
        }
        let url = format!("http://{}{}?{}", self.proxy, PROXY_RECORD_RESPONSE, key);
        let response = self
            .client
            .post(&url)
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| ResponderError::Publish(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResponderError::Publish(format!(
                "{}: {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    async fn cleanup(&self) {
        let url = format!("http://{}{}", self.proxy, PROXY_CLEANUP_RESPONSES);
        match self.client.post(&url).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(url = %url, status = %response.status(), "proxy cleanup rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(url = %url, error = %e, "proxy cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_acme_key_rejected_without_network() {
        let responder = ProxyResponder::new("127.0.0.1:1").unwrap();
        let err = responder.respond("/etc/passwd", "x").await.unwrap_err();
        assert!(matches!(err, ResponderError::NotAcmeChallenge(_)));
    }
}
