//! Warden gateway server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden_core::config::ServerConfig;
use warden_gateway::{http, Gateway};

#[derive(Debug, Parser)]
#[command(name = "warden-gateway", about = "Secrets-isolation gateway server")]
struct Args {
    /// Configuration directory (holds server.json and key directories).
    #[arg(long, env = "WARDEN_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load_from_dir(&args.config_dir)
        .with_context(|| format!("loading config from {}", args.config_dir.display()))?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let listen_addr = config.listen_addr.clone();
    let gateway = Arc::new(Gateway::from_config(config).context("assembling gateway")?);

    gateway.start_ingestors().await;
    let sweeper = gateway.sessions.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(listen = listen_addr.as_str(), "gateway listening");

    // Shutdown order: stop ingestors, close the listener, then drain
    // in-flight requests on a ten-second budget.
    let (drain_tx, mut drain_rx) = tokio::sync::watch::channel(false);
    let shutdown_gateway = Arc::clone(&gateway);
    let serve = axum::serve(listener, http::router(Arc::clone(&gateway)))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, stopping ingestors");
            shutdown_gateway.ingestors.stop_all().await;
            let _ = drain_tx.send(true);
        });

    tokio::select! {
        result = serve => result.context("serving")?,
        () = async {
            loop {
                if drain_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
                if *drain_rx.borrow() {
                    break;
                }
            }
            tokio::time::sleep(DRAIN_BUDGET).await;
        } => {
            tracing::warn!("drain budget exceeded, aborting in-flight requests");
        }
    }

    sweeper.abort();
    info!("gateway stopped");
    Ok(())
}

const DRAIN_BUDGET: std::time::Duration = std::time::Duration::from_secs(10);
