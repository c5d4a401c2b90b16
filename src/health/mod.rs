// src/health/mod.rs
mod checker;

pub use checker::{probe, CycleReport, HealthMonitor, ProbeError, ProbeResult};
