//! API gateway entry point.
//!
//! Wires the routing fabric, rate limiting, and the asynchronous job plane,
//! then serves HTTP with graceful shutdown.

use anyhow::Result;
use chrono::Utc;
use discovery::{ServiceRegistration, ServiceRegistry};
use gateway::{create_router, AppState, Config, ProxyHandler, RateLimiter, TokenService};
use gateway::handlers::auth::UserDirectory;
use gateway::GATEWAY_SERVICE_NAME;
use job_store::store::DEFAULT_RETENTION_HOURS;
use job_store::{JobStore, StatusConsumer};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{NatsClient, StreamConfig};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Maximum job records kept in memory.
const MAX_TRACKED_JOBS: usize = 10_000;

/// Idle TTL for rate-limit buckets.
const RATE_LIMIT_TTL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize logging before any component construction.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("Starting API gateway");
    info!(
        "Configuration loaded: port={}, consul={}, nats={}",
        config.port, config.consul_address, config.nats_address
    );

    // Prometheus recorder; rendered by GET /metrics.
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // Job store and its retention sweeper.
    let store = JobStore::new(
        MAX_TRACKED_JOBS,
        chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
    );
    let (store_sweep_tx, store_sweep_rx) = mpsc::channel(1);
    let store_sweeper = store.spawn_sweeper(store_sweep_rx);

    // NATS with the durable jobs stream.
    let nats = NatsClient::connect(&config.nats_address, GATEWAY_SERVICE_NAME).await?;
    nats.ensure_stream(&StreamConfig::jobs()).await?;
    info!("Jobs stream ready");

    // Status consumer: constructed after both the store and the broker
    // client exist, so neither needs a reference to build the other.
    let (status_tx, status_rx) = mpsc::channel(1);
    let consumer = StatusConsumer::new(store.clone(), nats.clone(), status_rx);
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!("status consumer failed: {:?}", e);
        }
    });

    // Rate limiter; debug deployments get a permissive limit for testing.
    let (rate, burst) = if config.log_level == "debug" {
        (1000.0, 2000)
    } else {
        (100.0, 200)
    };
    let limiter = Arc::new(RateLimiter::new(rate, burst, RATE_LIMIT_TTL));
    let (limiter_sweep_tx, limiter_sweep_rx) = mpsc::channel(1);
    let limiter_sweeper = limiter.spawn_sweeper(limiter_sweep_rx);

    // Service registry; the gateway registers its own entry so peers can
    // discover it. A unique id avoids conflicts between co-hosted gateways.
    let registry = Arc::new(ServiceRegistry::new(&config.consul_address)?);
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let gateway_id = format!(
        "{}-{}-{}",
        GATEWAY_SERVICE_NAME,
        hostname,
        Utc::now().timestamp()
    );
    let registration = ServiceRegistration::new(
        &gateway_id,
        GATEWAY_SERVICE_NAME,
        // The externally reachable address in real deployments.
        "localhost",
        config.port,
    )
    .with_tags(vec!["gateway".to_string(), "api".to_string()])
    .with_meta(HashMap::from([(
        "version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    )]));

    if let Err(e) = registry.register(&registration).await {
        warn!("failed to register gateway with the registry: {}", e);
    } else {
        info!("API gateway registered with the service registry");
    }

    let proxy = ProxyHandler::new(Arc::clone(&registry), GATEWAY_SERVICE_NAME);

    let state = Arc::new(AppState {
        tokens: TokenService::new(&config.jwt_secret, config.jwt_expiration_minutes),
        users: UserDirectory::with_dev_users(),
        store,
        nats: nats.clone(),
        proxy,
        limiter,
        metrics: metrics_handle,
        config: config.clone(),
    });

    let app = create_router(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down...");

    // Stop the watchers and background tasks, then drain the broker and
    // drop the registry entry.
    state.proxy.shutdown().await;
    let _ = status_tx.send(()).await;
    let _ = store_sweep_tx.send(()).await;
    let _ = limiter_sweep_tx.send(()).await;

    if let Err(e) = nats.drain().await {
        warn!("failed to drain NATS connection: {}", e);
    }
    if let Err(e) = registry.deregister(&gateway_id).await {
        warn!("failed to deregister gateway: {}", e);
    } else {
        info!("API gateway deregistered from the service registry");
    }

    let _ = consumer_handle.await;
    let _ = store_sweeper.await;
    let _ = limiter_sweeper.await;

    info!("Server gracefully stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
