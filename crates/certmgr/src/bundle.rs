//! The certificate bundle: an ordered X.509 chain plus its private key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use flotilla_common::jitter::jittery_hour;

use crate::error::CertError;

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// A parsed certificate bundle.
///
/// Holds the PEM forms served to disk and to the transport codec, the DER
/// chain handed to the TLS stack, and the leaf validity window. A bundle is
/// immutable; rotation replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    cert_pem: String,
    key_pem: String,
    chain_der: Vec<Vec<u8>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateBundle {
    /// Build a bundle from PEM blocks (local files, remote store).
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self, CertError> {
        let chain_der = parse_chain(&cert_pem)?;
        let (not_before, not_after) = leaf_validity(&chain_der[0])?;
        Ok(Self {
            cert_pem,
            key_pem,
            chain_der,
            not_before,
            not_after,
        })
    }

    /// Build a bundle from a DER chain, as returned by an ACME order.
    pub fn from_der_chain(chain_der: Vec<Vec<u8>>, key_pem: String) -> Result<Self, CertError> {
        if chain_der.is_empty() {
            return Err(CertError::CertificateParse("empty chain".to_string()));
        }
        let cert_pem = pem_from_chain(&chain_der);
        let (not_before, not_after) = leaf_validity(&chain_der[0])?;
        Ok(Self {
            cert_pem,
            key_pem,
            chain_der,
            not_before,
            not_after,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Bundles are ordered by leaf expiry.
    pub fn is_newer_than(&self, other: Option<&CertificateBundle>) -> bool {
        match other {
            Some(other) => self.not_after > other.not_after,
            None => true,
        }
    }

    /// Time remaining until this bundle should be renewed: renewal is due
    /// when `renew_before` of the certificate lifetime remains. Lifetimes
    /// under an hour are treated as a jittery hour so pathological
    /// certificates cannot produce a renewal busy-loop.
    ///
    /// Negative means renewal is overdue.
    pub fn time_until_renewal(&self, renew_before: f64) -> ChronoDuration {
        let mut lifetime = self.not_after - self.not_before;
        if lifetime < ChronoDuration::hours(1) {
            lifetime = ChronoDuration::from_std(jittery_hour()).unwrap_or(ChronoDuration::hours(1));
        }
        let head_start = ChronoDuration::seconds((lifetime.num_seconds() as f64 * renew_before) as i64);
        self.not_after - head_start - Utc::now()
    }
}

/// PEM-encode a DER chain, leaf first, blank line between certificates.
pub fn pem_from_chain(chain_der: &[Vec<u8>]) -> String {
    let blocks: Vec<String> = chain_der
        .iter()
        .map(|der| encode_pem(CERTIFICATE_LABEL, der))
        .collect();
    blocks.join("\n")
}

/// PEM-encode one block with deterministic formatting (64 columns, LF).
pub fn encode_pem(label: &str, der: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(label, der.to_vec()),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Parse every CERTIFICATE block out of a PEM chain.
pub fn parse_chain(cert_pem: &str) -> Result<Vec<Vec<u8>>, CertError> {
    let mut chain = Vec::new();
    for block in x509_parser::pem::Pem::iter_from_buffer(cert_pem.as_bytes()) {
        let block = block
            .map_err(|e| CertError::CertificateParse(format!("bad PEM block: {}", e)))?;
        if block.label != CERTIFICATE_LABEL {
            return Err(CertError::CertificateParse(format!(
                "certificate type {} not supported",
                block.label
            )));
        }
        chain.push(block.contents);
    }
    if chain.is_empty() {
        return Err(CertError::CertificateParse(
            "no CERTIFICATE block in PEM".to_string(),
        ));
    }
    Ok(chain)
}

/// Parse the single private-key block out of a PEM file.
///
/// Returns the block label (e.g. "EC PRIVATE KEY") and the DER contents.
pub fn parse_key_pem(key_pem: &str) -> Result<(String, Vec<u8>), CertError> {
    let block = x509_parser::pem::Pem::iter_from_buffer(key_pem.as_bytes())
        .next()
        .ok_or_else(|| CertError::CertificateParse("no PEM block in private key".to_string()))?
        .map_err(|e| CertError::CertificateParse(format!("bad key PEM: {}", e)))?;
    Ok((block.label, block.contents))
}

fn leaf_validity(leaf_der: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), CertError> {
    let (_, cert) = X509Certificate::from_der(leaf_der)
        .map_err(|e| CertError::CertificateParse(format!("failed to parse leaf: {}", e)))?;
    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| CertError::CertificateParse("invalid NotBefore".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| CertError::CertificateParse("invalid NotAfter".to_string()))?;
    Ok((not_before, not_after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::{TEST_CHAIN_PEM, TEST_TYPED_KEY_PEM};

    #[test]
    fn test_from_pem_parses_validity() {
        let bundle = CertificateBundle::from_pem(
            TEST_CHAIN_PEM.to_string(),
            TEST_TYPED_KEY_PEM.to_string(),
        )
        .unwrap();
        assert_eq!(bundle.chain_der().len(), 2);
        assert!(bundle.not_after() > bundle.not_before());
    }

    #[test]
    fn test_chain_pem_roundtrip() {
        let chain = parse_chain(TEST_CHAIN_PEM).unwrap();
        assert_eq!(pem_from_chain(&chain), TEST_CHAIN_PEM);
    }

    #[test]
    fn test_newer_than_ordering() {
        let bundle = CertificateBundle::from_pem(
            TEST_CHAIN_PEM.to_string(),
            TEST_TYPED_KEY_PEM.to_string(),
        )
        .unwrap();
        assert!(bundle.is_newer_than(None));
        assert!(!bundle.is_newer_than(Some(&bundle)));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(CertificateBundle::from_pem("not pem".into(), "nope".into()).is_err());
    }

    #[test]
    fn test_renewal_time_is_before_expiry() {
        let bundle = CertificateBundle::from_pem(
            TEST_CHAIN_PEM.to_string(),
            TEST_TYPED_KEY_PEM.to_string(),
        )
        .unwrap();
        // The fixture certificate lives for a century; with a third of the
        // lifetime reserved the renewal moment is decades away but still
        // strictly before expiry.
        let remaining = bundle.time_until_renewal(0.33);
        assert!(remaining > ChronoDuration::zero());
        assert!(remaining < bundle.not_after() - Utc::now());
    }
}
