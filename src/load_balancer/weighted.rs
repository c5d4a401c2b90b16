// src/load_balancer/weighted.rs
use crate::proxy::{BackendEndpoint, RegistrySnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weighted round robin as a cumulative-weight walk: a counter modulo the
/// total weight of the eligible backends picks the backend whose cumulative
/// range contains it.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    weights: HashMap<BackendEndpoint, u32>,
    counter: AtomicU64,
}

impl WeightedRoundRobin {
    pub fn new(weights: HashMap<BackendEndpoint, u32>) -> Self {
        Self {
            weights,
            counter: AtomicU64::new(0),
        }
    }

    pub fn from_snapshot(snapshot: &RegistrySnapshot) -> Self {
        Self::new(
            snapshot
                .backends
                .iter()
                .map(|(ep, state)| (ep.clone(), state.metric))
                .collect(),
        )
    }

    pub fn weights(&self) -> &HashMap<BackendEndpoint, u32> {
        &self.weights
    }

    fn weight_of(&self, endpoint: &BackendEndpoint) -> u64 {
        // missing entries weigh nothing, so they are never walked into
        self.weights.get(endpoint).copied().unwrap_or(0) as u64
    }

    pub fn select_server(&self, eligible: &[BackendEndpoint]) -> Option<BackendEndpoint> {
        let total: u64 = eligible.iter().map(|ep| self.weight_of(ep)).sum();
        if total == 0 {
            return None;
        }

        let position = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur % total + 1) % total)
            })
            .unwrap_or_else(|cur| cur)
            % total;

        let mut cumulative = 0u64;
        for endpoint in eligible {
            let weight = self.weight_of(endpoint);
            if weight == 0 {
                continue;
            }
            cumulative += weight;
            if position < cumulative {
                return Some(endpoint.clone());
            }
        }

        None
    }
}
