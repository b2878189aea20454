//! Rolling replacement driven end to end against an in-memory record
//! store, with a stand-in for the external machinery that replaces
//! destroyed instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use flotilla_common::RecordType;
use flotilla_config::LbConfig;
use flotilla_dns::{MemoryRecordStore, RecordStore};
use flotilla_dnslb::{
    rolling_replace, Destroyer, IpSet, LbError, LbParams, LoadBalancer, NullHandler, RegionFilter,
};

const FQDN: &str = "lb.example.com";
const IPS: [&str; 3] = ["127.0.1.1", "127.0.1.2", "127.0.1.3"];

/// Destroys nothing real, but notes the order of destruction and
/// re-registers the "replacement" instance a moment later, playing the
/// role of the autoscaler plus the new instance's controller.
struct ReplacingDestroyer {
    store: Arc<MemoryRecordStore>,
    destroyed: Mutex<Vec<String>>,
}

#[async_trait]
impl Destroyer for ReplacingDestroyer {
    async fn destroy(&self, ips: &IpSet) -> Result<(), LbError> {
        self.destroyed.lock().extend(ips.iter().cloned());
        for ip in ips.clone() {
            let store = self.store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let (mut values, ttl) = store.read_records(FQDN, RecordType::A).await.unwrap();
                if !values.contains(&ip) {
                    values.push(ip);
                    store
                        .write_records(FQDN, RecordType::A, &values, ttl, false)
                        .await
                        .unwrap();
                }
            });
        }
        Ok(())
    }
}

fn config(port: u16) -> LbConfig {
    toml::from_str(&format!(
        r#"
        fqdn = "{}"
        tcp_port = {}
        check_interval_secs = 5
    "#,
        FQDN, port
    ))
    .unwrap()
}

async fn listen_all() -> u16 {
    let first = TcpListener::bind((IPS[0], 0)).await.unwrap();
    let port = first.local_addr().unwrap().port();
    for listener in [
        first,
        TcpListener::bind((IPS[1], port)).await.unwrap(),
        TcpListener::bind((IPS[2], port)).await.unwrap(),
    ] {
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
    }
    port
}

#[tokio::test]
async fn rolling_replace_visits_every_instance() {
    let port = listen_all().await;
    let store = Arc::new(MemoryRecordStore::new());
    // Short TTL keeps the drain sleeps down to test scale.
    store.seed(FQDN, RecordType::A, &IPS, Duration::from_millis(200));

    let destroyer = Arc::new(ReplacingDestroyer {
        store: store.clone(),
        destroyed: Mutex::new(Vec::new()),
    });
    let params = LbParams {
        store: store.clone(),
        region_filter: Arc::new(NullHandler),
        destroyer: destroyer.clone(),
    };

    // Sample the regional set size throughout the operation.
    let min_size = Arc::new(Mutex::new(usize::MAX));
    let sampler = {
        let store = store.clone();
        let min_size = min_size.clone();
        tokio::spawn(async move {
            loop {
                let (values, _) = store.read_records(FQDN, RecordType::A).await.unwrap();
                {
                    let mut min = min_size.lock();
                    *min = (*min).min(values.len());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    rolling_replace(&config(port), &params).await.unwrap();
    sampler.abort();

    // Every instance was visited exactly once.
    let mut destroyed = destroyer.destroyed.lock().clone();
    destroyed.sort();
    assert_eq!(destroyed, IPS.iter().map(|s| s.to_string()).collect::<Vec<_>>());

    // The set never dropped below original - 1.
    assert!(*min_size.lock() >= IPS.len() - 1);

    // The blocked record is gone and the set is back to strength.
    let (blocked, _) = store
        .read_records("_blocked.lb.example.com", RecordType::Txt)
        .await
        .unwrap();
    assert!(blocked.is_empty());
    let (values, _) = store.read_records(FQDN, RecordType::A).await.unwrap();
    assert_eq!(values.len(), IPS.len());
}

#[tokio::test]
async fn rolling_replace_requires_quorum() {
    let store = Arc::new(MemoryRecordStore::new());
    store.seed(FQDN, RecordType::A, &[IPS[0]], Duration::from_millis(200));
    let params = LbParams {
        store: store.clone(),
        region_filter: Arc::new(NullHandler),
        destroyer: Arc::new(NullHandler),
    };
    let err = rolling_replace(&config(9999), &params).await.unwrap_err();
    assert!(matches!(err, LbError::NoQuorum { found: 1 }));
}

#[tokio::test]
async fn rolling_replace_refuses_when_blocked() {
    let store = Arc::new(MemoryRecordStore::new());
    store.seed(FQDN, RecordType::A, &IPS, Duration::from_millis(200));
    let expires = (chrono::Utc::now() + chrono::Duration::minutes(5))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    store.seed(
        "_blocked.lb.example.com",
        RecordType::Txt,
        &[
            &format!("IP={}", IPS[1]),
            &format!("IpExpires={}", expires),
            "OwnerId=0badcafe",
            &format!("OwnerExpires={}", expires),
        ],
        Duration::from_secs(60),
    );
    let params = LbParams {
        store: store.clone(),
        region_filter: Arc::new(NullHandler),
        destroyer: Arc::new(NullHandler),
    };
    let err = rolling_replace(&config(9999), &params).await.unwrap_err();
    assert!(matches!(err, LbError::ReplaceActive));
}

/// A controller on the drained instance must not re-register while its
/// veto is active (the scenario rolling replace depends on).
#[tokio::test]
async fn drained_instance_respects_veto_during_replace() {
    let store = Arc::new(MemoryRecordStore::new());
    let expires = (chrono::Utc::now() + chrono::Duration::minutes(2))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    store.seed(FQDN, RecordType::A, &[IPS[1], IPS[2]], Duration::from_secs(5));
    store.seed(
        "_blocked.lb.example.com",
        RecordType::Txt,
        &[
            &format!("IP={}", IPS[0]),
            &format!("IpExpires={}", expires),
            "OwnerId=0badcafe",
            &format!("OwnerExpires={}", expires),
        ],
        Duration::from_secs(60),
    );
    let port = listen_all().await;
    let lb = LoadBalancer::new(
        config(port),
        LbParams {
            store: store.clone(),
            region_filter: Arc::new(NullHandler),
            destroyer: Arc::new(NullHandler),
        },
        IPS[0].to_string(),
    )
    .unwrap();
    lb.tick().await.unwrap();
    let (values, _) = store.read_records(FQDN, RecordType::A).await.unwrap();
    assert!(!values.contains(&IPS[0].to_string()));
}
