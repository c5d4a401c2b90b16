// src/load_balancer/algorithm.rs
use super::{LeastConnections, RoundRobin, WeightedRoundRobin};
use crate::proxy::BackendEndpoint;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The selection algorithm currently installed. Relays only ever call
/// `select_server`; the health monitor builds and swaps whole instances.
#[derive(Debug)]
pub enum Strategy {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
    WeightedRoundRobin(WeightedRoundRobin),
}

impl Strategy {
    /// Never returns an endpoint absent from `eligible`.
    pub fn select_server(&self, eligible: &[BackendEndpoint]) -> Option<BackendEndpoint> {
        match self {
            Strategy::RoundRobin(rr) => rr.select_server(eligible),
            Strategy::LeastConnections(lc) => lc.select_server(eligible),
            Strategy::WeightedRoundRobin(wrr) => wrr.select_server(eligible),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::RoundRobin(_) => StrategyKind::RoundRobin,
            Strategy::LeastConnections(_) => StrategyKind::LeastConnections,
            Strategy::WeightedRoundRobin(_) => StrategyKind::WeightedRoundRobin,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin(RoundRobin::new())
    }
}
