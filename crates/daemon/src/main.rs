//! flotillad - fleet instance daemon.
//!
//! Composition root: loads the TOML configuration, wires the certificate
//! manager to its responder, store and locker, starts the DNS load
//! balancer controller, and serves a TLS health endpoint on the probed
//! port using the managed certificate.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::info;

use flotilla_certmgr::{
    CertificateManager, DnsResponder, Fallback, FileVault, HttpResponder, Locker, ManagerConfig,
    ProxyResponder, Responder, Storer, VaultLockingStore,
};
use flotilla_config::{ChallengeType, Config, LOCK_MODE_NONE};
use flotilla_dns::{HetznerRecordStore, RecordStore};
use flotilla_dnslb::{
    detect_my_ip, Destroyer, HcloudProvider, InstanceHandler, LbParams, LoadBalancer, NullHandler,
    RegionFilter,
};

mod tls_server;

#[derive(Parser, Debug)]
#[command(name = "flotillad")]
#[command(author, version, about = "Fleet certificate and DNS load balancing daemon", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "FLOTILLA_CONFIG")]
    config: String,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(3);
        }
    };

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_file(&cli.config).context("failed to load configuration")?;
    if cli.test {
        println!("flotillad: configuration file {} test is successful", cli.config);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let record_store: Option<Arc<dyn RecordStore>> = match &config.dns {
        Some(dns) => Some(Arc::new(HetznerRecordStore::new(
            &dns.zone,
            &dns.read_token()?,
            Duration::from_secs(dns.api_timeout_secs),
        )?)),
        None => None,
    };

    let manager = match &config.acme {
        Some(acme) => Some(Arc::new(build_manager(&config, acme, record_store.clone()).await?)),
        None => match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => Some(Arc::new(
                CertificateManager::load_only(cert_file.clone(), key_file.clone())
                    .context("failed to load static certificate")?,
            )),
            _ => None,
        },
    };

    if let Some(lb) = &config.lb {
        let store = record_store
            .clone()
            .context("[lb] requires a [dns] section")?;
        let (region_filter, destroyer): (Arc<dyn RegionFilter>, Arc<dyn Destroyer>) =
            match &lb.compute {
                Some(compute) if !lb.all_regions => {
                    let provider = Arc::new(HcloudProvider::new(
                        &compute.location,
                        &compute.read_token()?,
                        Duration::from_secs(compute.api_timeout_secs),
                    )?);
                    let handler = Arc::new(InstanceHandler::new(provider));
                    if lb.preserve {
                        (handler, Arc::new(NullHandler))
                    } else {
                        (handler.clone(), handler)
                    }
                }
                _ => (Arc::new(NullHandler), Arc::new(NullHandler)),
            };
        let my_ip = detect_my_ip().context("cannot determine this instance's IP")?;
        LoadBalancer::spawn(
            lb.clone(),
            LbParams {
                store,
                region_filter,
                destroyer,
            },
            my_ip,
        )?;
    }

    match (manager, &config.lb) {
        (Some(manager), Some(lb)) if lb.do_tls => {
            tls_server::serve_health(manager, lb.tcp_port).await?;
        }
        _ => {
            info!("flotillad running");
            wait_for_shutdown_signal().await;
        }
    }
    Ok(())
}

async fn build_manager(
    config: &Config,
    acme: &flotilla_config::AcmeConfig,
    record_store: Option<Arc<dyn RecordStore>>,
) -> Result<CertificateManager> {
    let responder: Arc<dyn Responder> = match acme.challenge_type {
        ChallengeType::Dns01 => {
            let store = record_store.context("dns-01 requires a [dns] section")?;
            Arc::new(DnsResponder::new(store))
        }
        ChallengeType::Http01 => match &acme.proxy {
            Some(proxy) => Arc::new(ProxyResponder::new(proxy.clone())?),
            None => Arc::new(
                HttpResponder::serve(acme.http_port, Fallback::None)
                    .await
                    .context("failed to bind http-01 listener")?,
            ),
        },
    };

    if let Some(port) = acme.http_redirect_port {
        flotilla_certmgr::spawn_redirect_server(port)
            .await
            .context("failed to bind HTTPS redirect listener")?;
    }

    let (locker, storer): (Option<Arc<dyn Locker>>, Option<Arc<dyn Storer>>) = match &acme.store {
        Some(store_config) => {
            let vault = Arc::new(
                FileVault::open(&store_config.secret_id)
                    .context("failed to open certificate store")?,
            );
            let locking_store = Arc::new(VaultLockingStore::new(
                vault,
                store_config.secret_id.clone(),
            ));
            if store_config.lock_mode == LOCK_MODE_NONE {
                info!("store locking disabled; this must be the only renewing instance");
                (None, Some(locking_store))
            } else {
                (Some(locking_store.clone()), Some(locking_store))
            }
        }
        None => (None, None),
    };

    CertificateManager::new(
        ManagerConfig {
            names: acme.domain_names.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            challenge_type: acme.challenge_type,
            key_type: acme.key_type,
            directory_url: acme.directory_url.clone(),
            renew_before: acme.renew_before,
        },
        locker,
        responder,
        storer,
    )
    .context("failed to start certificate manager")
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
}
