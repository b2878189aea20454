//! acme-proxy - cluster-scoped http-01 challenge relay.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use flotilla_acme_proxy::{AcmeProxy, DnsHostResolver, ResponseStore};
use flotilla_common::api::ACME_PROXY_ADMIN_PORT;

#[derive(Parser, Debug)]
#[command(name = "acme-proxy")]
#[command(author, version, about = "ACME http-01 challenge relay", long_about = None)]
struct Cli {
    /// Port to listen on for ACME http-01 challenges
    #[arg(long = "acme-port", default_value_t = 80)]
    acme_port: u16,

    /// Admin port peers publish responses to
    #[arg(long = "admin-port", default_value_t = ACME_PROXY_ADMIN_PORT)]
    admin_port: u16,

    /// Backend port to retry on when a forward yields 404 (0 disables)
    #[arg(long = "fallback-port", default_value_t = 0)]
    fallback_port: u16,

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
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let fallback_port = (cli.fallback_port != 0).then_some(cli.fallback_port);
        let proxy = Arc::new(AcmeProxy::new(
            Arc::new(ResponseStore::new()),
            Arc::new(DnsHostResolver::new()?),
            fallback_port,
        )?);
        proxy
            .serve(cli.acme_port, cli.admin_port)
            .await
            .context("proxy server failed")
    })
}
