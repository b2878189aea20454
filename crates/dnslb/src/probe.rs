//! Peer liveness probes.
//!
//! A probe is a TCP dial, optionally followed by a TLS handshake with
//! certificate verification disabled: this is a liveness check, not an
//! identity check, and peers may be serving certificates for a name that
//! is not their IP.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::instances::IpSet;

/// Probe every IP concurrently; returns the failing subset.
pub(crate) async fn probe_peers(
    ips: &IpSet,
    port: u16,
    do_tls: bool,
    timeout: Duration,
) -> IpSet {
    let mut tasks = JoinSet::new();
    for ip in ips {
        let ip = ip.clone();
        tasks.spawn(async move {
            let result = probe_one(&ip, port, do_tls, timeout).await;
            (ip, result)
        });
    }

    let mut failing = IpSet::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((ip, Err(message))) => {
                debug!(ip = %ip, error = %message, "probe failed");
                failing.insert(ip);
            }
            Err(e) => debug!(error = %e, "probe task failed"),
        }
    }
    failing
}

/// One probe: dial, and handshake if requested, within the deadline.
pub(crate) async fn probe_one(
    ip: &str,
    port: u16,
    do_tls: bool,
    timeout: Duration,
) -> Result<(), String> {
    let attempt = async {
        let stream = TcpStream::connect((ip, port))
            .await
            .map_err(|e| format!("dial: {}", e))?;
        if do_tls {
            let server_name =
                ServerName::try_from(ip.to_string()).map_err(|e| format!("name: {}", e))?;
            let connector = TlsConnector::from(insecure_client_config()?);
            connector
                .connect(server_name, stream)
                .await
                .map_err(|e| format!("handshake: {}", e))?;
        }
        Ok(())
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| format!("timed out after {:?}", timeout))?
}

fn insecure_client_config() -> Result<Arc<ClientConfig>, String> {
    static CONFIG: std::sync::OnceLock<Arc<ClientConfig>> = std::sync::OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| format!("tls config: {}", e))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Accepts any server certificate. Liveness probes only.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        probe_one("127.0.0.1", port, false, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_fails_when_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe_one("127.0.0.1", port, false, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_probe_peers_partitions_results() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // 127.0.0.1 listens; 127.1.2.3 does not.
        let ips: IpSet = ["127.0.0.1".to_string(), "127.1.2.3".to_string()]
            .into_iter()
            .collect();
        let failing = probe_peers(&ips, port, false, Duration::from_secs(1)).await;
        assert_eq!(failing.len(), 1);
        assert!(failing.contains("127.1.2.3"));
    }
}
