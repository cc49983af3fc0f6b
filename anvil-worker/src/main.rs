//! Anvil Worker
//!
//! A build node. It accepts build tasks over HTTP, runs each one through the
//! pipeline on a container, ssh or local backend, and streams its output to
//! any number of viewers while it runs.
//!
//! Architecture:
//! - Configuration: settings from environment or defaults
//! - Repositories: result, coordination and credential stores
//! - Backends: where build commands execute
//! - Pipeline: the per-build phase state machine
//! - Valet: registry of in-flight builds, kill and crash recovery
//! - Log multiplexer: live and stored build output for viewers
//! - Scheduler: bounded queue and per-build fault boundary
//! - API: build, log and kill endpoints plus the bootstrap file server

mod api;
mod backend;
mod config;
mod logmux;
mod pipeline;
mod repository;
mod scheduler;
mod sync;
#[cfg(test)]
mod testutil;
mod valet;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::backend::{BackendFactory, BackendProvider};
use crate::config::Config;
use crate::logmux::LogMux;
use crate::pipeline::{Launcher, PullRequestCommenter, WebhookNotifier};
use crate::repository::{
    ConsulStore, CoordinationStore, CredentialStore, InMemoryCoordinationStore,
    InMemoryResultStore, PgResultStore, ResultStore, StaticCredentialStore,
};
use crate::scheduler::{BuildQueue, Dispatcher};
use crate::valet::{Interrupt, Valet};

/// Queued builds allowed per parallel slot
const QUEUE_DEPTH_PER_SLOT: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anvil_worker=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Anvil Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, backend={:?}, bind_addr={}",
        config.worker_id, config.backend, config.bind_addr
    );

    scheduler::fault::install_hook();

    let results = connect_results(&config).await?;
    let coordination = connect_coordination(&config);
    let credentials = load_credentials(&config).await?;
    let factory = Arc::new(BackendFactory::from_config(&config)?);

    let valet = Arc::new(Valet::new(
        config.worker_id.clone(),
        coordination,
        Arc::clone(&results),
        factory.cleaner(),
    ));
    let mux = Arc::new(LogMux::new(config.log_poll_interval));

    let mut launcher = Launcher::new(&config, Arc::clone(&valet), Arc::clone(&mux), credentials, factory)
        .with_hook(Arc::new(PullRequestCommenter::new()));
    if let Some(url) = &config.notify_webhook_url {
        info!("Build summaries will be posted to {}", url);
        launcher = launcher.with_hook(Arc::new(WebhookNotifier::new(url.clone())));
    }

    register_with_retry(&valet, &config.bind_addr.to_string()).await?;

    let (queue, queued) = BuildQueue::channel(config.max_parallel_builds * QUEUE_DEPTH_PER_SLOT);
    let dispatcher = Dispatcher::new(
        Arc::new(launcher),
        Arc::clone(&valet),
        config.max_parallel_builds,
        queued,
    );
    tokio::spawn(dispatcher.run());

    serve_bootstrap(&config).await?;

    let state = AppState {
        valet: Arc::clone(&valet),
        mux,
        results,
        queue,
        kill_wait: config.kill_wait,
    };
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    let mut server = tokio::spawn(async move { axum::serve(listener, api::create_router(state)).await });

    let received = tokio::select! {
        received = shutdown_signal() => received?,
        finished = &mut server => {
            return match finished {
                Ok(Ok(())) => Err(anyhow::anyhow!("API server stopped unexpectedly")),
                Ok(Err(e)) => Err(e).context("API server failed"),
                Err(e) => Err(e).context("API server task failed"),
            };
        }
    };

    warn!("Received {}, shutting down", received);
    let report = valet
        .handle_interrupt(&Interrupt::Signal(received.to_string()))
        .await;
    valet.wait_all_done().await;

    if !report.errors.is_empty() {
        error!("Shutdown finished with {} recovery error(s)", report.errors.len());
    }
    std::process::exit(1);
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({:#}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn connect_results(config: &Config) -> Result<Arc<dyn ResultStore>> {
    match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let store = PgResultStore::connect(url)
                .await
                .context("Failed to connect to result database")?;
            info!("Database connection pool created");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, build results are kept in memory");
            Ok(Arc::new(InMemoryResultStore::new()))
        }
    }
}

fn connect_coordination(config: &Config) -> Arc<dyn CoordinationStore> {
    match &config.coordination_url {
        Some(url) => Arc::new(ConsulStore::new(url.clone())),
        None => {
            warn!("COORDINATION_URL not set, coordination state is local to this node");
            Arc::new(InMemoryCoordinationStore::new())
        }
    }
}

async fn load_credentials(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    match &config.credentials_file {
        Some(path) => {
            let store = StaticCredentialStore::from_file(path).await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(StaticCredentialStore::default())),
    }
}

/// Starts the bootstrap file server for the life of the node
async fn serve_bootstrap(config: &Config) -> Result<()> {
    if !config.bootstrap_dir.is_dir() {
        warn!(
            "Bootstrap directory {} does not exist, setup downloads will fail",
            config.bootstrap_dir.display()
        );
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.service_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind bootstrap server to {}", addr))?;
    info!(
        "Serving bootstrap files from {} on {}",
        config.bootstrap_dir.display(),
        addr
    );

    let app = api::bootstrap_router(&config.bootstrap_dir);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Bootstrap server failed: {}", e);
        }
    });
    Ok(())
}

/// Waits for SIGINT or SIGTERM and returns its name
async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Register with the coordination store, retrying with exponential backoff
///
/// The store may not be reachable yet when the worker starts.
async fn register_with_retry(valet: &Valet, location: &str) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match valet.register_node(location).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Registered node after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(anyhow::anyhow!(
                        "Failed to register node after {} attempts: {}",
                        MAX_RETRIES,
                        e
                    ));
                }

                warn!(
                    "Failed to register node (attempt {}/{}): {}, retrying in {} ms",
                    attempt, MAX_RETRIES, e, delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
