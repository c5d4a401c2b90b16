// src/metrics/collector.rs
use crate::load_balancer::StrategyKind;
use anyhow::Result;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Session metrics
    pub sessions_total: IntCounterVec,
    pub session_duration_seconds: HistogramVec,
    pub bytes_relayed_total: IntCounterVec,
    pub selection_exhausted_total: IntCounter,

    // Backend metrics
    pub backend_connect_failures_total: IntCounterVec,
    pub backend_connections_active: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,

    // Strategy metrics
    pub strategy_switches_total: IntCounterVec,

    // System metrics
    pub active_sessions: IntGauge,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let per_backend = &["backend"];

        Ok(Self {
            sessions_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_sessions_total", "Connections routed to a backend"),
                    &["backend", "strategy"],
                )?,
            )?,
            session_duration_seconds: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "lb_session_duration_seconds",
                        "Relay session duration in seconds",
                    ),
                    per_backend,
                )?,
            )?,
            bytes_relayed_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_bytes_relayed_total", "Bytes relayed, by direction"),
                    &["direction"],
                )?,
            )?,
            selection_exhausted_total: register(
                registry,
                IntCounter::new(
                    "lb_selection_exhausted_total",
                    "Connections closed because no backend could be reached",
                )?,
            )?,
            backend_connect_failures_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("lb_backend_connect_failures_total", "Failed upstream connects"),
                    per_backend,
                )?,
            )?,
            backend_connections_active: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "lb_backend_connections_active",
                        "Open relays per backend, resynced every health cycle",
                    ),
                    per_backend,
                )?,
            )?,
            backend_health_status: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "lb_backend_health_status",
                        "Last probe outcome (1=healthy, 0=unhealthy)",
                    ),
                    per_backend,
                )?,
            )?,
            strategy_switches_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "lb_strategy_switches_total",
                        "Strategy changes made by the health monitor",
                    ),
                    &["strategy"],
                )?,
            )?,
            active_sessions: register(
                registry,
                IntGauge::new("lb_active_sessions", "Open relay sessions")?,
            )?,
            healthy_backends: register(
                registry,
                IntGauge::new("lb_healthy_backends", "Backends that passed the last probe")?,
            )?,
            total_backends: register(
                registry,
                IntGauge::new("lb_total_backends", "Configured backends")?,
            )?,
        })
    }

    pub fn record_routed(&self, backend: &str, strategy: &str) {
        self.sessions_total
            .with_label_values(&[backend, strategy])
            .inc();
    }

    pub fn record_session_end(
        &self,
        backend: &str,
        to_upstream: u64,
        to_client: u64,
        duration: std::time::Duration,
    ) {
        self.bytes_relayed_total
            .with_label_values(&["upstream"])
            .inc_by(to_upstream);
        self.bytes_relayed_total
            .with_label_values(&["client"])
            .inc_by(to_client);
        self.session_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_connect_failure(&self, backend: &str) {
        self.backend_connect_failures_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn record_selection_exhausted(&self) {
        self.selection_exhausted_total.inc();
    }

    pub fn update_backend_connections(&self, backend: &str, count: i64) {
        self.backend_connections_active
            .with_label_values(&[backend])
            .set(count);
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        self.backend_health_status
            .with_label_values(&[backend])
            .set(i64::from(healthy));
    }

    pub fn record_strategy_switch(&self, kind: StrategyKind) {
        self.strategy_switches_total
            .with_label_values(&[kind.name()])
            .inc();
    }

    pub fn increment_active_sessions(&self) {
        self.active_sessions.inc();
    }

    pub fn decrement_active_sessions(&self) {
        self.active_sessions.dec();
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Wall-clock timer for session durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
