//! The proxy's two HTTP surfaces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, RawQuery, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use flotilla_common::api::{ACME_PATH, PROXY_CLEANUP_RESPONSES, PROXY_RECORD_RESPONSE};

use crate::resolver::HostResolver;
use crate::responses::{RecordOutcome, ResponseStore};

/// Timeout for forwarded challenge fetches
const FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to resolve host: {0}")]
    Resolve(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The public-surface state: response store plus forwarding machinery.
pub struct AcmeProxy {
    store: Arc<ResponseStore>,
    resolver: Arc<dyn HostResolver>,
    client: reqwest::Client,
    /// Second-chance port for forwards that return 404
    fallback_port: Option<u16>,
}

impl AcmeProxy {
    pub fn new(
        store: Arc<ResponseStore>,
        resolver: Arc<dyn HostResolver>,
        fallback_port: Option<u16>,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Configuration(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            store,
            resolver,
            client,
            fallback_port,
        })
    }

    pub fn store(&self) -> Arc<ResponseStore> {
        self.store.clone()
    }

    /// Serve both surfaces until either listener fails.
    pub async fn serve(self: Arc<Self>, acme_port: u16, admin_port: u16) -> Result<(), ProxyError> {
        let public = TcpListener::bind(("::", acme_port)).await?;
        let admin = TcpListener::bind(("::", admin_port)).await?;
        info!(acme_port, admin_port, "acme-proxy listening");

        let public_app = public_router(self.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let admin_app =
            admin_router(self.store()).into_make_service_with_connect_info::<SocketAddr>();

        tokio::select! {
            served = axum::serve(public, public_app) => served?,
            served = axum::serve(admin, admin_app) => served?,
        }
        Ok(())
    }
}

/// Router for the public ACME surface.
pub fn public_router(proxy: Arc<AcmeProxy>) -> Router {
    Router::new().fallback(public_handler).with_state(proxy)
}

/// Router for the peer-facing admin surface.
pub fn admin_router(store: Arc<ResponseStore>) -> Router {
    Router::new()
        .route(PROXY_RECORD_RESPONSE, post(record_handler))
        .route(PROXY_CLEANUP_RESPONSES, post(cleanup_handler))
        .with_state(store)
}

async fn public_handler(State(proxy): State<Arc<AcmeProxy>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let host_header = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    debug!(method = %request.method(), host = %host_header, path = %path, "public request");

    if !path.starts_with(ACME_PATH) {
        return (StatusCode::NOT_FOUND, "Not an ACME challenge").into_response();
    }
    if request.method() != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "Use GET").into_response();
    }

    // Every IP the named host resolves to is a candidate peer.
    let bare_host = strip_port(&host_header);
    match proxy.resolver.resolve(bare_host).await {
        Ok(candidates) => {
            let candidates: Vec<String> =
                candidates.iter().map(|ip| ip.to_string()).collect();
            if let Some(body) = proxy.store.lookup(&candidates, &path) {
                info!(host = %host_header, path = %path, "OK (cached)");
                return (StatusCode::OK, body).into_response();
            }
        }
        Err(e) => warn!(host = %bare_host, error = %e, "host resolution failed"),
    }

    forward(&proxy, &host_header, &path).await
}

/// Re-ask the named host directly, with a second try on the fallback
/// port when the first forward 404s.
async fn forward(proxy: &AcmeProxy, host: &str, path: &str) -> Response {
    let url = format!("http://{}{}", host, path);
    let mut response = match proxy.client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "forward failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "Error getting response").into_response();
        }
    };
    let mut final_url = url;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        if let Some(fallback_port) = proxy.fallback_port {
            let fallback_url =
                format!("http://{}:{}{}", strip_port(host), fallback_port, path);
            response = match proxy.client.get(&fallback_url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %fallback_url, error = %e, "fallback forward failed");
                    return (StatusCode::SERVICE_UNAVAILABLE, "Error getting response")
                        .into_response();
                }
            };
            final_url = fallback_url;
        }
    }

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    if status == StatusCode::OK {
        info!(url = %final_url, "OK (forwarded)");
    } else {
        info!(url = %final_url, status = %status, "forwarded");
    }
    match response.bytes().await {
        Ok(body) => (status, body).into_response(),
        Err(e) => {
            warn!(url = %final_url, error = %e, "error copying body");
            (StatusCode::SERVICE_UNAVAILABLE, "Error reading body").into_response()
        }
    }
}

async fn record_handler(
    State(store): State<Arc<ResponseStore>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let peer_ip = peer.ip().to_string();
    let path = query.unwrap_or_default();
    match store.record(&peer_ip, &path, body) {
        RecordOutcome::Recorded => {
            info!(peer = %peer_ip, path = %path, "recorded response");
            StatusCode::OK.into_response()
        }
        RecordOutcome::TooLarge => (StatusCode::NOT_ACCEPTABLE, "Too much data").into_response(),
        RecordOutcome::TooMany => {
            (StatusCode::TOO_MANY_REQUESTS, "Too much data").into_response()
        }
        RecordOutcome::Duplicate => (StatusCode::CONFLICT, "Duplicate path").into_response(),
    }
}

async fn cleanup_handler(
    State(store): State<Arc<ResponseStore>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    store.cleanup(&peer.ip().to_string());
    StatusCode::OK.into_response()
}

fn strip_port(hostport: &str) -> &str {
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => hostport,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("host.example:80"), "host.example");
        assert_eq!(strip_port("host.example"), "host.example");
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
    }
}
