//! Local http-01 responder.
//!
//! Serves challenge responses from its own listener. When no fallback
//! handler is configured the listener closes every new connection while
//! the response map is empty, so a fleet member exposes nothing on port 80
//! outside of an active order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tracing::{debug, error};

use flotilla_common::api::ACME_PATH;

use crate::error::{CertError, ResponderError};
use crate::responder::Responder;

/// What to do with non-challenge requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// No fallback: reject non-challenge paths, and close connections
    /// outright while no responses are registered.
    None,
    /// Redirect GET/HEAD to the same URL on HTTPS with 302; reject other
    /// methods with 400.
    RedirectToHttps,
}

/// http-01 responder backed by a local listener.
#[derive(Debug, Clone)]
pub struct HttpResponder {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    fallback: Fallback,
    responses: RwLock<HashMap<String, String>>,
}

impl HttpResponder {
    /// Create a responder without binding a listener; use this to embed
    /// [`handle`] into an existing server.
    ///
    /// [`handle`]: HttpResponder::handle
    pub fn new_handler(fallback: Fallback) -> Self {
        Self {
            inner: Arc::new(Shared {
                fallback,
                responses: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a responder and bind a listener on `port`.
    ///
    /// Normally 80, unless a firewall DNATs public port 80 elsewhere.
    pub async fn serve(port: u16, fallback: Fallback) -> Result<Self, CertError> {
        let responder = Self::new_handler(fallback);
        let listener = TcpListener::bind(("::", port)).await?;
        let inner = responder.inner.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "http-01 accept failed");
                        continue;
                    }
                };
                // With no fallback and nothing to serve, expose no HTTP
                // surface at all.
                if inner.fallback == Fallback::None && inner.responses.read().is_empty() {
                    debug!(peer = %peer, "closing connection, no responses registered");
                    drop(stream);
                    continue;
                }
                let inner = inner.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let inner = inner.clone();
                        async move { Ok::<_, hyper::Error>(handle(&inner, &req)) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "http-01 connection error");
                    }
                });
            }
        });
        Ok(responder)
    }

    /// Serve one request against the response map.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        handle(&self.inner, req)
    }
}

/// Bind a listener on `port` that only redirects to HTTPS.
///
/// For instances whose challenges are solved elsewhere (dns-01 or an
/// ACME proxy) but that still want port 80 to point browsers at the TLS
/// port. Do not combine with [`HttpResponder::serve`] on the same port.
pub async fn spawn_redirect_server(port: u16) -> Result<(), CertError> {
    let listener = TcpListener::bind(("::", port)).await?;
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "redirect accept failed");
                    continue;
                }
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    Ok::<_, hyper::Error>(redirect_to_https(&req))
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(error = %e, "redirect connection error");
                }
            });
        }
    });
    Ok(())
}

fn handle<B>(shared: &Shared, req: &Request<B>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    debug!(method = %req.method(), path = %path, "http-01 request");
    if !path.starts_with(ACME_PATH) {
        return match shared.fallback {
            Fallback::None => plain(StatusCode::NOT_FOUND, "not an ACME challenge"),
            Fallback::RedirectToHttps => redirect_to_https(req),
        };
    }
    let response = shared.responses.read().get(path).cloned();
    match response {
        Some(body) => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "")),
        None => {
            debug!(path = %path, "no token for path");
            plain(StatusCode::NOT_FOUND, "no token for path")
        }
    }
}

/// Redirect GET/HEAD to the TLS port, preserving path and query.
fn redirect_to_https<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return plain(StatusCode::BAD_REQUEST, "Use HTTPS");
    }
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("https://{}{}", host, path_and_query);
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, target)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, ""))
}

fn strip_port(hostport: &str) -> &str {
    match hostport.rsplit_once(':') {
        // Leave IPv6 literals like [::1] alone.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => hostport,
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(&self, key: &str, value: &str) -> Result<(), ResponderError> {
        self.inner
            .responses
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn cleanup(&self) {
        self.inner.responses.write().clear();
    }
}
