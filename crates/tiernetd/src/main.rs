//! tiernetd — the tiernet daemon.
//!
//! Runs one tier of the network control plane:
//! - State store (redb)
//! - Address pools and job registrar (root tier)
//! - Resolution cache, interest tracking and status relay
//! - REST API
//!
//! # Usage
//!
//! ```text
//! tiernetd root --listen 0.0.0.0:10100 --data-dir /var/lib/tiernet
//! tiernetd cluster --config /etc/tiernet/cluster.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tiernet_discovery::{HttpClusterNotifier, HttpParentClient, Tier, TopicBus};
use tiernet_state::StateStore;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::TierConfig;

const DEFAULT_FILTER: &str = "info,tiernetd=debug,tiernet=debug";

#[derive(Parser)]
#[command(name = "tiernetd", about = "tiernet network control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the root tier (owns the address pools).
    Root(TierArgs),
    /// Run a cluster tier below a parent.
    Cluster {
        #[command(flatten)]
        args: TierArgs,

        /// Cluster id announced to the parent.
        #[arg(long)]
        cluster_id: Option<String>,

        /// Base URL of the parent tier.
        #[arg(long)]
        parent_url: Option<String>,
    },
}

#[derive(Args)]
struct TierArgs {
    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl TierArgs {
    fn load(&self) -> anyhow::Result<TierConfig> {
        let mut config = match &self.config {
            Some(path) => TierConfig::from_file(path)?,
            None => TierConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Root(args) => run_root(args.load()?).await,
        Command::Cluster {
            args,
            cluster_id,
            parent_url,
        } => {
            let mut config = args.load()?;
            if cluster_id.is_some() {
                config.cluster.id = cluster_id;
            }
            if parent_url.is_some() {
                config.parent.url = parent_url;
            }
            run_cluster(config).await
        }
    }
}

fn open_store(config: &TierConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run_root(config: TierConfig) -> anyhow::Result<()> {
    info!("tiernet daemon starting as root tier");

    let store = open_store(&config)?;
    let notifier = HttpClusterNotifier::new(store.clone(), config.parent.retry.clone())?;
    let tier = Arc::new(Tier::root(store, Arc::new(notifier)));

    let (shutdown_tx, _) = watch::channel(false);
    serve(tiernet_api::root_router(tier), config.listen, shutdown_tx).await?;

    info!("tiernet root tier stopped");
    Ok(())
}

async fn run_cluster(config: TierConfig) -> anyhow::Result<()> {
    let identity = config.cluster_identity()?;
    info!(cluster_id = %identity.cluster_id, parent = %identity.parent_url, "tiernet daemon starting as cluster tier");

    let store = open_store(&config)?;
    let parent = HttpParentClient::new(
        identity.parent_url.clone(),
        identity.cluster_id.clone(),
        config.parent.retry.clone(),
    )?;
    let bus = TopicBus::default();
    let tier = Arc::new(Tier::cluster(
        identity.cluster_id.clone(),
        store,
        Arc::new(parent),
        Arc::new(bus.clone()),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let bus_handle = tokio::spawn(log_publications(bus, shutdown_rx));

    let registration = tier.clone();
    tokio::spawn(async move {
        if let Err(e) = registration
            .register_with_parent(&identity.advertise_address, identity.advertise_port)
            .await
        {
            warn!(error = %e, "registration with parent tier failed");
        }
    });

    serve(tiernet_api::cluster_router(tier), config.listen, shutdown_tx).await?;

    let _ = bus_handle.await;
    info!("tiernet cluster tier stopped");
    Ok(())
}

/// Trace every message published to workers.
async fn log_publications(bus: TopicBus, mut shutdown: watch::Receiver<bool>) {
    let mut publications = bus.subscribe();
    loop {
        tokio::select! {
            received = publications.recv() => match received {
                Ok(publication) => debug!(topic = %publication.topic, "published to worker"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "publication log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Serve `router` until Ctrl-C, then signal `shutdown`.
async fn serve(
    router: axum::Router,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
) -> anyhow::Result<()> {
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c, serving until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown.send(true);
        })
        .await?;
    Ok(())
}
