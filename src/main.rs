mod config;
mod download;
mod error;
mod fetcher;
mod git;
mod http;
mod metrics;
mod packagist;
mod rewrite;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::fetcher::RemoteFetcher;
use crate::git::GitMirror;
use crate::metrics::MetricsRegistry;
use crate::packagist::PackagistMirror;
use crate::store::Store;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "composercache", about = "Composer repository caching mirror")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/composercache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub packagist: Arc<PackagistMirror>,
    pub git: Arc<GitMirror>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .mirror
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting composercache");

    // ---- Data directories ----
    tokio::fs::create_dir_all(config.storage.git_dir())
        .await
        .with_context(|| {
            format!(
                "failed to create git data dir: {}",
                config.storage.git_dir().display()
            )
        })?;

    // ---- Store ----
    let store = {
        let dir = config.storage.composer_dir();
        let code = config.mirror.code.clone();
        tokio::task::spawn_blocking(move || Store::open(&dir, &code))
            .await
            .context("store open task panicked")??
    };
    let store = Arc::new(store);
    tracing::info!(bucket = %config.mirror.code, "store opened");

    // ---- Infrastructure ----
    let http_client = reqwest::Client::builder()
        .user_agent("composercache/0.1")
        .build()
        .context("failed to build reqwest client")?;
    let fetcher = RemoteFetcher::new(http_client);
    let metrics = MetricsRegistry::new();

    // ---- Mirrors ----
    let packagist = Arc::new(PackagistMirror::new(
        Arc::clone(&store),
        fetcher,
        Arc::clone(&config),
        metrics.clone(),
    ));
    let git = Arc::new(GitMirror::new(
        config.storage.git_dir(),
        config.git.binary.clone(),
        Duration::from_secs(config.git.sync_interval),
        metrics.clone(),
    ));

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        packagist: Arc::clone(&packagist),
        git: Arc::clone(&git),
        metrics,
    };

    // ---- Spawn services ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = run_http_server(state, shutdown).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let packagist_handle = tokio::spawn(Arc::clone(&packagist).run_sync(shutdown_rx.clone()));
    let git_handle = tokio::spawn(Arc::clone(&git).run_sync(shutdown_rx.clone()));

    // ---- Await shutdown ----
    shutdown_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    let _ = tokio::try_join!(http_handle, packagist_handle, git_handle);

    tracing::info!("composercache shut down cleanly");
    Ok(())
}
