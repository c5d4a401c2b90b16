// src/config/models.rs
use crate::proxy::BackendEndpoint;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.backends.is_empty(), "at least one backend must be configured");

        let mut seen = HashSet::new();
        for backend in &self.backends {
            ensure!(
                seen.insert(&backend.address),
                "backend {} is configured more than once",
                backend.address
            );
        }
        ensure!(
            self.backends.iter().any(|b| b.weight > 0),
            "at least one backend needs a non-zero weight"
        );

        ensure!(self.health_check.interval_secs > 0, "health_check.interval_secs must be > 0");
        ensure!(self.health_check.timeout_ms > 0, "health_check.timeout_ms must be > 0");
        ensure!(self.relay.max_attempts > 0, "relay.max_attempts must be > 0");
        ensure!(self.relay.buffer_size > 0, "relay.buffer_size must be > 0");
        ensure!(self.relay.connect_timeout_ms > 0, "relay.connect_timeout_ms must be > 0");
        ensure!(self.listener.max_connections > 0, "listener.max_connections must be > 0");
        ensure!(
            self.metrics.path.starts_with('/'),
            "metrics.path must start with '/'"
        );
        if self.metrics.enabled {
            ensure!(
                self.metrics.port != self.listener.port,
                "metrics.port must differ from listener.port"
            );
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// A backend is either a bare `"host:port"` or `{ address, weight }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "BackendEntry")]
pub struct BackendConfig {
    pub address: BackendEndpoint,
    pub weight: u32,
}

impl BackendConfig {
    pub fn new(address: BackendEndpoint, weight: u32) -> Self {
        Self { address, weight }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BackendEntry {
    Plain(BackendEndpoint),
    Weighted {
        address: BackendEndpoint,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl From<BackendEntry> for BackendConfig {
    fn from(entry: BackendEntry) -> Self {
        match entry {
            BackendEntry::Plain(address) => Self::new(address, default_weight()),
            BackendEntry::Weighted { address, weight } => Self::new(address, weight),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Total active connections across eligible backends above which the
    /// monitor switches to least-connections.
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            high_load_threshold: default_high_load_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_telemetry_path")]
    pub path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_telemetry_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_weight() -> u32 {
    1
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_health_timeout_ms() -> u64 {
    1000
}

fn default_high_load_threshold() -> usize {
    5
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_attempts() -> usize {
    3
}

fn default_buffer_size() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

fn default_telemetry_path() -> PathBuf {
    PathBuf::from("traffic_log.csv")
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
