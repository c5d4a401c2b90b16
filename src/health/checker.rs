// src/health/checker.rs
use crate::config::{AdaptiveConfig, HealthCheckConfig};
use crate::load_balancer::{choose_strategy, StrategyHandle, StrategyKind};
use crate::metrics::MetricsCollector;
use crate::proxy::{BackendEndpoint, BackendRegistry, EligibilityUpdate};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("probe task failed: {0}")]
    Task(String),
}

#[derive(Debug)]
pub struct ProbeResult {
    pub backend: BackendEndpoint,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<ProbeError>,
}

/// What one monitor cycle observed and decided.
#[derive(Debug)]
pub struct CycleReport {
    pub probes: Vec<ProbeResult>,
    pub eligibility: EligibilityUpdate,
    pub strategy: StrategyKind,
    pub previous_strategy: StrategyKind,
}

/// Probes every configured backend on a fixed interval, re-derives the
/// eligible set and installs the strategy the observed load calls for.
pub struct HealthMonitor {
    config: HealthCheckConfig,
    adaptive: AdaptiveConfig,
    registry: Arc<BackendRegistry>,
    strategy: Arc<StrategyHandle>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        adaptive: AdaptiveConfig,
        registry: Arc<BackendRegistry>,
        strategy: Arc<StrategyHandle>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            adaptive,
            registry,
            strategy,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Run cycles until [`HealthMonitor::shutdown`] is called. Nothing that
    /// happens inside a cycle ends the loop.
    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health monitor with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One probe-and-adapt cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let probes = self.probe_all().await;

        let outcomes: Vec<(BackendEndpoint, bool)> = probes
            .iter()
            .map(|p| (p.backend.clone(), p.healthy))
            .collect();
        let eligibility = self.registry.apply_probe_results(&outcomes);
        self.log_eligibility(&probes, &eligibility);

        let snapshot = self.registry.metrics_snapshot();
        if let Some(metrics) = &self.metrics {
            for (endpoint, state) in &snapshot.backends {
                metrics.update_backend_health(endpoint.as_str(), state.healthy);
                metrics.update_backend_connections(
                    endpoint.as_str(),
                    state.active_connections as i64,
                );
            }
            metrics.update_backend_counts(snapshot.healthy_count(), snapshot.backends.len());
        }

        let next = choose_strategy(&snapshot, &self.adaptive);
        let strategy = next.kind();
        let previous_strategy = self.strategy.swap(next).kind();

        if strategy != previous_strategy {
            info!(
                from = %previous_strategy,
                to = %strategy,
                active = snapshot.eligible_active(),
                "Switching load balancing strategy"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_strategy_switch(strategy);
            }
        } else {
            debug!(strategy = %strategy, "Strategy reinstalled");
        }

        CycleReport {
            probes,
            eligibility,
            strategy,
            previous_strategy,
        }
    }

    async fn probe_all(&self) -> Vec<ProbeResult> {
        let endpoints = self.registry.endpoints();
        let probe_timeout = self.config.timeout();

        let tasks: Vec<_> = endpoints
            .iter()
            .cloned()
            .map(|endpoint| tokio::spawn(probe(endpoint, probe_timeout)))
            .collect();

        // join_all keeps task order, so results line up with `endpoints`
        let results = futures::future::join_all(tasks).await;

        endpoints
            .into_iter()
            .zip(results)
            .map(|(backend, result)| match result {
                Ok(probe_result) => probe_result,
                Err(e) => {
                    error!(backend = %backend, "Probe task join error: {}", e);
                    ProbeResult {
                        backend,
                        healthy: false,
                        response_time_ms: 0,
                        error: Some(ProbeError::Task(e.to_string())),
                    }
                }
            })
            .collect()
    }

    fn log_eligibility(&self, probes: &[ProbeResult], update: &EligibilityUpdate) {
        for probe in probes {
            match &probe.error {
                None => debug!(
                    backend = %probe.backend,
                    response_time_ms = probe.response_time_ms,
                    "Backend is healthy"
                ),
                Some(e) => debug!(backend = %probe.backend, "Backend probe failed: {}", e),
            }
        }
        for endpoint in &update.became_unhealthy {
            warn!(backend = %endpoint, "Backend is unhealthy and will be removed");
        }
        for endpoint in &update.became_healthy {
            info!(backend = %endpoint, "Backend recovered");
        }

        if update.retained_previous {
            error!(
                eligible = update.eligible.len(),
                "All backends are unhealthy, keeping last eligible set until health improves"
            );
        } else {
            let healthy = probes.iter().filter(|p| p.healthy).count();
            info!(
                "Health check complete: {} healthy, {} unhealthy",
                healthy,
                probes.len() - healthy
            );
        }
    }
}

/// Bare TCP handshake against `endpoint`, bounded by `probe_timeout`.
pub async fn probe(endpoint: BackendEndpoint, probe_timeout: Duration) -> ProbeResult {
    let start = std::time::Instant::now();

    let error = match timeout(probe_timeout, TcpStream::connect(endpoint.as_str())).await {
        // the stream is dropped right away; reachability is all we check
        Ok(Ok(_stream)) => None,
        Ok(Err(e)) => Some(ProbeError::Connect(e)),
        Err(_) => Some(ProbeError::Timeout(probe_timeout)),
    };

    ProbeResult {
        backend: endpoint,
        healthy: error.is_none(),
        response_time_ms: start.elapsed().as_millis() as u64,
        error,
    }
}
