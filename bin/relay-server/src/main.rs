//! Relay Server
//!
//! Single binary running:
//! - Inbound gateway (webhook admission)
//! - Route table refresh
//! - Async-ingest staging
//! - Delivery worker pool
//! - Prometheus exporter (optional)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_config::{LogConfig, LogFormat, RelayConfig};
use relay_dispatcher::Dispatcher;
use relay_plugins::PluginRegistry;
use relay_proxy::{Gateway, GatewayConfig, Router, Stager};
use relay_store::SqliteStore;
use relay_worker::{HttpDeliverer, HttpDelivererConfig, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Webhook relay - receive, persist and deliver events")]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Create the database schema and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RelayConfig::load(args.config.as_deref())?;

    init_tracing(&config.log)?;
    info!("Starting relay server");

    if let Some(addr) = config.metrics.listen {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Metrics exporter listening on http://{}/metrics", addr);
    }

    // 1. Durable store; also the task queue
    let store = Arc::new(SqliteStore::connect(&config.database.url, config.database.max_connections).await?);
    store.init_schema().await?;
    if args.migrate_only {
        info!("Schema ready, exiting");
        store.close().await;
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 2. Route table, loaded once before accepting traffic
    let router = Arc::new(Router::new(store.clone(), PluginRegistry::with_builtins()));
    match router.reload().await {
        Ok(routes) => info!(routes, "Route table loaded"),
        Err(e) => warn!(error = %e, "Initial route load failed, starting with an empty table"),
    }
    let refresh_handle = router
        .clone()
        .spawn_refresh(config.proxy.router_refresh_interval(), shutdown_tx.subscribe());

    // 3. Dispatcher and staging buffer. Staging stops after the gateway so
    // requests still in flight can be staged.
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), store.clone()));
    let (staging_shutdown_tx, _) = broadcast::channel::<()>(1);
    let (stager, staging_handle) = Stager::spawn(
        config.proxy.staging_capacity,
        dispatcher.clone(),
        staging_shutdown_tx.subscribe(),
    );

    // 4. Gateway
    let app = Gateway::new(GatewayConfig::from(&config.proxy), router.clone(), dispatcher)
        .with_stager(stager)
        .into_router();
    let listener = TcpListener::bind(config.proxy.listen).await?;
    info!("Gateway listening on http://{}", config.proxy.listen);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Gateway shutting down");
            });
            if let Err(e) = server.await {
                error!("Gateway error: {}", e);
            }
        })
    };

    // 5. Delivery workers
    let pool = if config.worker.enabled {
        let deliverer = Arc::new(HttpDeliverer::new(HttpDelivererConfig::default())?);
        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            store.clone(),
            store.clone(),
            deliverer,
        ));
        pool.start(&shutdown_tx);
        Some(pool)
    } else {
        info!("Delivery workers disabled");
        None
    };

    info!("Relay server started");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    // one deadline covers both the gateway drain and the worker pool
    let deadline = tokio::time::Instant::now() + config.worker.shutdown_timeout();
    let drained = tokio::time::timeout_at(deadline, async {
        let _ = server_handle.await;
        let _ = staging_shutdown_tx.send(());
        let _ = staging_handle.await;
        let _ = refresh_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Gateway did not drain before the shutdown timeout");
    }
    if let Some(pool) = pool {
        pool.shutdown_by(deadline).await;
    }

    store.close().await;
    info!("Relay server shutdown complete");
    Ok(())
}

fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)?,
    };
    match log.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
