//! Operator tool for the DNS load balancer: block an IP or run a
//! rolling replacement of a region's instances.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use flotilla_config::Config;
use flotilla_dns::{HetznerRecordStore, RecordStore};
use flotilla_dnslb::{
    block, rolling_replace, Destroyer, HcloudProvider, InstanceHandler, LbParams, RegionFilter,
};

#[derive(Parser, Debug)]
#[command(name = "dnslb-ctl")]
#[command(author, version, about = "DNS load balancer operator tool", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "FLOTILLA_CONFIG")]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Block an IP from self-registering for a while
    Block {
        /// The IP address to block
        ip: String,

        /// How long to block, in minutes
        #[arg(long = "duration", default_value_t = 15)]
        duration_minutes: u64,
    },
    /// Replace every instance in the configured region, one at a time
    RollingReplace,
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
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let lb_config = config
            .lb
            .clone()
            .context("configuration has no [lb] section")?;
        let dns_config = config
            .dns
            .as_ref()
            .context("configuration has no [dns] section")?;
        let store: Arc<dyn RecordStore> = Arc::new(HetznerRecordStore::new(
            &dns_config.zone,
            &dns_config.read_token()?,
            Duration::from_secs(dns_config.api_timeout_secs),
        )?);

        match cli.command {
            Commands::Block {
                ip,
                duration_minutes,
            } => {
                let (cancel_tx, cancel_rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    wait_for_shutdown_signal().await;
                    info!("caught signal: cleaning up gracefully");
                    let _ = cancel_tx.send(()).await;
                });
                block(
                    store,
                    &lb_config.fqdn,
                    &ip,
                    Duration::from_secs(duration_minutes * 60),
                    cancel_rx,
                )
                .await
                .with_context(|| format!("error blocking IP {}", ip))?;
            }
            Commands::RollingReplace => {
                let (region_filter, destroyer): (Arc<dyn RegionFilter>, Arc<dyn Destroyer>) =
                    match &lb_config.compute {
                        Some(compute) if !lb_config.preserve => {
                            let provider = Arc::new(HcloudProvider::new(
                                &compute.location,
                                &compute.read_token()?,
                                Duration::from_secs(compute.api_timeout_secs),
                            )?);
                            let handler = Arc::new(InstanceHandler::new(provider));
                            (handler.clone(), handler)
                        }
                        _ => anyhow::bail!(
                            "rolling-replace requires [lb.compute] and preserve = false"
                        ),
                    };
                let params = LbParams {
                    store,
                    region_filter,
                    destroyer,
                };
                rolling_replace(&lb_config, &params)
                    .await
                    .context("rolling replace failed")?;
            }
        }
        Ok(())
    })
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
}
