// src/proxy/registry.rs
use super::backend::{BackendEndpoint, BackendState};
use crate::config::BackendConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Authoritative store of backend health, connection counts and the derived
/// eligible set. Every operation runs inside one short critical section.
#[derive(Debug)]
pub struct BackendRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    /// Configuration order, never changes after construction.
    order: Vec<BackendEndpoint>,
    states: HashMap<BackendEndpoint, BackendState>,
    eligible: Vec<BackendEndpoint>,
}

/// Point-in-time copy of the registry, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub backends: Vec<(BackendEndpoint, BackendState)>,
    pub eligible: Vec<BackendEndpoint>,
}

/// Result of applying one round of probe outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityUpdate {
    pub eligible: Vec<BackendEndpoint>,
    pub became_healthy: Vec<BackendEndpoint>,
    pub became_unhealthy: Vec<BackendEndpoint>,
    /// Set when no backend was healthy and the previous eligible set was kept.
    pub retained_previous: bool,
}

impl BackendRegistry {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut order = Vec::with_capacity(configs.len());
        let mut states = HashMap::with_capacity(configs.len());

        for config in configs {
            if states.contains_key(&config.address) {
                continue;
            }
            order.push(config.address.clone());
            states.insert(config.address.clone(), BackendState::new(config.weight));
        }

        // Everything starts healthy so traffic flows before the first probe.
        let eligible = order.clone();

        Self {
            inner: Mutex::new(RegistryInner {
                order,
                states,
                eligible,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // No critical section can leave the maps half-written, so a poisoned
        // lock still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All configured endpoints, in configuration order.
    pub fn endpoints(&self) -> Vec<BackendEndpoint> {
        self.lock().order.clone()
    }

    pub fn list_eligible(&self) -> Vec<BackendEndpoint> {
        self.lock().eligible.clone()
    }

    pub fn is_healthy(&self, endpoint: &BackendEndpoint) -> Option<bool> {
        self.lock().states.get(endpoint).map(|s| s.healthy)
    }

    pub fn active_connections(&self, endpoint: &BackendEndpoint) -> Option<usize> {
        self.lock().states.get(endpoint).map(|s| s.active_connections)
    }

    pub fn total_active(&self) -> usize {
        self.lock().states.values().map(|s| s.active_connections).sum()
    }

    /// Mark one backend healthy or unhealthy and re-derive the eligible set.
    /// Returns the previous health flag, or `None` for an unknown endpoint.
    pub fn set_health(&self, endpoint: &BackendEndpoint, healthy: bool) -> Option<bool> {
        let mut inner = self.lock();
        let state = inner.states.get_mut(endpoint)?;
        let previous = std::mem::replace(&mut state.healthy, healthy);
        inner.recompute_eligible();
        Some(previous)
    }

    /// Apply a whole probe cycle in one critical section.
    pub fn apply_probe_results(&self, results: &[(BackendEndpoint, bool)]) -> EligibilityUpdate {
        let mut inner = self.lock();
        let mut update = EligibilityUpdate::default();

        for (endpoint, healthy) in results {
            let Some(state) = inner.states.get_mut(endpoint) else {
                continue;
            };
            match (state.healthy, *healthy) {
                (false, true) => update.became_healthy.push(endpoint.clone()),
                (true, false) => update.became_unhealthy.push(endpoint.clone()),
                _ => {}
            }
            state.healthy = *healthy;
        }

        update.retained_previous = !inner.recompute_eligible();
        update.eligible = inner.eligible.clone();
        update
    }

    pub fn increment_active(&self, endpoint: &BackendEndpoint) -> bool {
        match self.lock().states.get_mut(endpoint) {
            Some(state) => {
                state.active_connections += 1;
                true
            }
            None => false,
        }
    }

    /// Counts never go below zero; an unmatched decrement is reported and
    /// otherwise ignored.
    pub fn decrement_active(&self, endpoint: &BackendEndpoint) -> bool {
        let mut inner = self.lock();
        let Some(state) = inner.states.get_mut(endpoint) else {
            return false;
        };
        if state.active_connections == 0 {
            tracing::warn!(backend = %endpoint, "active connection count already zero");
            return false;
        }
        state.active_connections -= 1;
        true
    }

    /// Increment the count for `endpoint` and return a guard that decrements
    /// it exactly once, on `release` or on drop.
    pub fn acquire(self: &Arc<Self>, endpoint: BackendEndpoint) -> ActiveConnection {
        let counted = self.increment_active(&endpoint);
        ActiveConnection {
            registry: Arc::clone(self),
            endpoint,
            released: !counted,
        }
    }

    pub fn metrics_snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        RegistrySnapshot {
            backends: inner
                .order
                .iter()
                .filter_map(|ep| inner.states.get(ep).map(|s| (ep.clone(), s.clone())))
                .collect(),
            eligible: inner.eligible.clone(),
        }
    }
}

impl RegistryInner {
    /// Returns false when nothing is healthy and the old set was kept.
    fn recompute_eligible(&mut self) -> bool {
        let healthy: Vec<BackendEndpoint> = self
            .order
            .iter()
            .filter(|ep| self.states.get(*ep).is_some_and(|s| s.healthy))
            .cloned()
            .collect();

        if healthy.is_empty() {
            return false;
        }
        self.eligible = healthy;
        true
    }
}

impl RegistrySnapshot {
    pub fn state(&self, endpoint: &BackendEndpoint) -> Option<&BackendState> {
        self.backends
            .iter()
            .find(|(ep, _)| ep == endpoint)
            .map(|(_, state)| state)
    }

    /// Sum of active connections across the eligible set.
    pub fn eligible_active(&self) -> usize {
        self.eligible
            .iter()
            .filter_map(|ep| self.state(ep))
            .map(|s| s.active_connections)
            .sum()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|(_, s)| s.healthy).count()
    }
}

/// Counted reference to an upstream session.
#[derive(Debug)]
pub struct ActiveConnection {
    registry: Arc<BackendRegistry>,
    endpoint: BackendEndpoint,
    released: bool,
}

impl ActiveConnection {
    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    /// Idempotent: only the first call touches the registry.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.decrement_active(&self.endpoint);
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.release();
    }
}
