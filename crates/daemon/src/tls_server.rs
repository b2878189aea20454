//! TLS health endpoint served with the managed certificate.
//!
//! Answers load-balancer probes (TCP dial plus TLS handshake) and gives
//! the certificate manager a consumer: connections resolve their
//! certificate through the manager, so a renewed bundle is served on the
//! next handshake with no restart.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use flotilla_certmgr::CertificateManager;

pub async fn serve_health(manager: Arc<CertificateManager>, port: u16) -> Result<()> {
    let tls_config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("TLS provider setup failed")?
    .with_no_client_auth()
    .with_cert_resolver(manager);
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(("::", port))
        .await
        .with_context(|| format!("failed to bind TLS listener on port {}", port))?;
    info!(port, "serving TLS health endpoint");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    // Probes hang up mid-handshake all the time.
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let served = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service_fn(health))
                .await;
            if let Err(e) = served {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn health(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from("ok\n")))
        .expect("static response"))
}
