//! End-to-end proxy behavior over real listeners on loopback.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use flotilla_acme_proxy::{
    admin_router, public_router, AcmeProxy, HostResolver, ProxyError, ResponseStore,
    MAX_RESPONSES_PER_PEER, MAX_RESPONSE_SIZE,
};

/// Resolves every host to a fixed candidate list.
struct FixedResolver {
    ips: Vec<IpAddr>,
}

#[async_trait]
impl HostResolver for FixedResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, ProxyError> {
        Ok(self.ips.clone())
    }
}

async fn spawn_public(proxy: Arc<AcmeProxy>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            public_router(proxy).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn spawn_admin(store: Arc<ResponseStore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            admin_router(store).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn proxy_with(store: Arc<ResponseStore>, ips: Vec<IpAddr>, fallback: Option<u16>) -> Arc<AcmeProxy> {
    Arc::new(AcmeProxy::new(store, Arc::new(FixedResolver { ips }), fallback).unwrap())
}

/// Recorded response served for a host that resolves to the recording
/// peer.
#[tokio::test]
async fn cached_response_is_served() {
    let store = Arc::new(ResponseStore::new());
    let admin = spawn_admin(store.clone()).await;
    let client = reqwest::Client::new();

    // The peer records from 127.0.0.1, so the proxy indexes it there.
    let url = format!(
        "http://{}/api/responses/recordOne?/.well-known/acme-challenge/tok",
        admin
    );
    let response = client.post(&url).body("body").send().await.unwrap();
    assert_eq!(response.status(), 200);

    let proxy = proxy_with(store, vec!["127.0.0.1".parse().unwrap()], None);
    let public = spawn_public(proxy).await;
    let response = client
        .get(format!("http://{}/.well-known/acme-challenge/tok", public))
        .header("Host", "host.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "body");
}

#[tokio::test]
async fn non_get_and_foreign_paths_are_rejected() {
    let store = Arc::new(ResponseStore::new());
    let proxy = proxy_with(store, vec![], None);
    let public = spawn_public(proxy).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/.well-known/acme-challenge/tok", public))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    let response = client
        .get(format!("http://{}/index.html", public))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

/// With no cached response the proxy re-asks the named host.
#[tokio::test]
async fn uncached_request_is_forwarded() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let app = Router::new().route(
            "/.well-known/acme-challenge/{token}",
            get(|| async { "origin-body" }),
        );
        axum::serve(origin, app).await.unwrap();
    });

    let store = Arc::new(ResponseStore::new());
    let proxy = proxy_with(store, vec![], None);
    let public = spawn_public(proxy).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/.well-known/acme-challenge/tok", public))
        .header("Host", origin_addr.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "origin-body");
}

/// A 404 from the origin triggers a second try on the fallback port.
#[tokio::test]
async fn fallback_port_is_tried_on_404() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        // Answers 404 to everything.
        axum::serve(origin, Router::new()).await.unwrap();
    });

    let fallback = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fallback_port = fallback.local_addr().unwrap().port();
    tokio::spawn(async move {
        let app = Router::new().route(
            "/.well-known/acme-challenge/{token}",
            get(|| async { "fallback-body" }),
        );
        axum::serve(fallback, app).await.unwrap();
    });

    let store = Arc::new(ResponseStore::new());
    let proxy = proxy_with(store, vec![], Some(fallback_port));
    let public = spawn_public(proxy).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/.well-known/acme-challenge/tok", public))
        .header("Host", origin_addr.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fallback-body");
}

/// The certmgr publisher talking to a real proxy: respond, serve,
/// cleanup.
#[tokio::test]
async fn proxy_responder_publishes_and_cleans_up() {
    use flotilla_certmgr::{ProxyResponder, Responder};

    let store = Arc::new(ResponseStore::new());
    let admin = spawn_admin(store.clone()).await;
    let responder = ProxyResponder::new(admin.to_string()).unwrap();

    responder
        .respond("/.well-known/acme-challenge/tok", "tok.auth")
        .await
        .unwrap();
    // Keys outside the challenge prefix never reach the proxy.
    assert!(responder.respond("/etc/passwd", "x").await.is_err());

    let proxy = proxy_with(store.clone(), vec!["127.0.0.1".parse().unwrap()], None);
    let public = spawn_public(proxy).await;
    let response = reqwest::Client::new()
        .get(format!("http://{}/.well-known/acme-challenge/tok", public))
        .header("Host", "host.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "tok.auth");

    responder.cleanup().await;
    assert_eq!(store.count("127.0.0.1"), 0);
}

/// Admission rules on the admin surface: size, count, duplicates,
/// method.
#[tokio::test]
async fn admin_admission_rules() {
    let store = Arc::new(ResponseStore::new());
    let admin = spawn_admin(store.clone()).await;
    let client = reqwest::Client::new();
    let record_url = |path: &str| format!("http://{}/api/responses/recordOne?{}", admin, path);

    // Oversized body.
    let response = client
        .post(record_url("/big"))
        .body(vec![b'x'; MAX_RESPONSE_SIZE + 1])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 406);

    // Fill the peer to the brim.
    for i in 0..MAX_RESPONSES_PER_PEER {
        let response = client
            .post(record_url(&format!("/p{}", i)))
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    // The 101st distinct path.
    let response = client
        .post(record_url("/p-over"))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);

    // Cleanup, then a duplicate.
    let response = client
        .post(format!("http://{}/api/responses/cleanup", admin))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(store.count("127.0.0.1"), 0);

    let response = client.post(record_url("/dup")).body("x").send().await.unwrap();
    assert_eq!(response.status(), 200);
    let response = client.post(record_url("/dup")).body("x").send().await.unwrap();
    assert_eq!(response.status(), 409);

    // Non-POST.
    let response = client.get(record_url("/get")).send().await.unwrap();
    assert_eq!(response.status(), 405);
}
