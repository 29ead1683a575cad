//! fleetstated - fleetstate control-plane daemon.
//!
//! Startup sequence: load configuration, start the lock coordinator, wait
//! for the leadership grant, run pending migrations, then flip readiness.
//! Loss of leadership or a failed migration is fatal; the process exits
//! nonzero so the supervisor restarts it into a fresh election.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetstate_core::config::FleetstateConfig;
use fleetstate_core::lock::InMemoryLockService;
use fleetstate_daemon::{readiness, runtime::ControlPlane};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// fleetstate control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "fleetstated")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fleetstate.toml")]
    config: PathBuf,

    /// Override the database path from the configuration file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Address to serve the HTTP readiness endpoint on
    #[arg(long)]
    health_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = FleetstateConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(db_path) = args.db_path {
        config.store.db_path = db_path;
    }

    // Each process instance gets a fresh identity so a restarted process
    // never mistakes its predecessor's lock record for its own.
    let owner = uuid::Uuid::new_v4().to_string();
    info!(owner = %owner, config = %args.config.display(), "fleetstated starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Single-node stand-in behind the LockService trait; a networked lock
    // client slots in here without touching the coordinator.
    let lock_service = Arc::new(InMemoryLockService::new());
    let mut plane = ControlPlane::start(&config, owner, lock_service, shutdown_rx.clone())
        .context("starting control plane")?;

    if let Some(addr) = args.health_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding readiness endpoint on {addr}"))?;
        info!(%addr, "serving readiness endpoint");
        let health_readiness = plane.readiness.clone();
        let health_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = readiness::serve(listener, health_readiness, health_shutdown).await {
                error!(error = %e, "readiness endpoint failed");
            }
        });
    }

    let outcome = tokio::select! {
        result = plane.wait() => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            plane.wait().await
        },
    };

    let _ = shutdown_tx.send(true);
    plane.stop().await;

    match outcome {
        Ok(()) => {
            info!("fleetstated stopped");
            Ok(())
        },
        Err(e) => {
            error!(error = %e, "fleetstated exiting");
            Err(e.into())
        },
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        () = sigterm => {},
    }
}
