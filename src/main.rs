// src/main.rs
use anyhow::{Context, Result};
use l4_load_balancer::{
    config::{self, Config},
    health::HealthMonitor,
    load_balancer::StrategyHandle,
    metrics::{start_metrics_server, MetricsRegistry},
    proxy::{BackendRegistry, ConnectionRelay},
    server::ServerBuilder,
    telemetry::{CsvFileSink, NullSink, RoutingSink},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("l4_load_balancer=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    if let Err(e) = run(config).await {
        error!("Load balancer failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics = metrics_registry.collector();

    // Shared state: registry and the active strategy
    let registry = Arc::new(BackendRegistry::new(&config.backends));
    let strategy = Arc::new(StrategyHandle::default());
    info!(
        backends = config.backends.len(),
        strategy = strategy.current().name(),
        "Starting with all backends eligible"
    );

    let sink: Arc<dyn RoutingSink> = if config.telemetry.enabled {
        Arc::new(
            CsvFileSink::open(&config.telemetry.path)
                .await
                .context("Failed to open telemetry sink")?,
        )
    } else {
        Arc::new(NullSink)
    };

    let relay = Arc::new(
        ConnectionRelay::new(
            config.relay.clone(),
            registry.clone(),
            strategy.clone(),
            sink,
        )
        .with_metrics(metrics.clone()),
    );

    // Bind before starting background work so a taken port fails fast
    let server = ServerBuilder::new(config.listener.socket_addr(), relay)
        .with_backlog(config.listener.backlog)
        .with_max_connections(config.listener.max_connections)
        .with_drain_timeout(config.listener.drain_timeout())
        .bind()
        .await?;

    // Start health monitor
    let monitor = Arc::new(HealthMonitor::new(
        config.health_check.clone(),
        config.adaptive.clone(),
        registry.clone(),
        strategy,
        Some(metrics),
    ));
    let monitor_task = tokio::spawn(monitor.clone().start());

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr = SocketAddr::new(config.listener.bind_address, config.metrics.port);
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    info!("Load balancer is listening on {}", server.local_addr());
    let report = server.serve_until(shutdown_signal()).await;

    monitor.shutdown();
    if let Err(e) = monitor_task.await {
        warn!("Health monitor task ended abnormally: {}", e);
    }

    info!(
        accepted = report.accepted,
        drained = report.drained,
        aborted = report.aborted,
        remaining_active = registry.total_active(),
        "Shutdown complete"
    );
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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

    info!("Shutdown signal received");
}
