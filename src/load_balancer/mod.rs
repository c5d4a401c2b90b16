// src/load_balancer/mod.rs
mod algorithm;
mod handle;
mod least_conn;
mod round_robin;
mod weighted;

pub use algorithm::{Strategy, StrategyKind};
pub use handle::StrategyHandle;
pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::config::AdaptiveConfig;
use crate::proxy::RegistrySnapshot;

/// Pick the strategy the current load calls for.
///
/// Above the high-load threshold, least-connections over this snapshot;
/// with every eligible backend idle, a fresh round robin; otherwise
/// weighted round robin over the configured weights, unless no eligible
/// backend carries any weight.
pub fn choose_strategy(snapshot: &RegistrySnapshot, config: &AdaptiveConfig) -> Strategy {
    if snapshot.eligible_active() > config.high_load_threshold {
        return Strategy::LeastConnections(LeastConnections::from_snapshot(snapshot));
    }

    let all_idle = snapshot
        .eligible
        .iter()
        .filter_map(|ep| snapshot.state(ep))
        .all(|state| state.active_connections == 0);

    let weighted = snapshot
        .eligible
        .iter()
        .filter_map(|ep| snapshot.state(ep))
        .any(|state| state.metric > 0);

    if all_idle || !weighted {
        Strategy::RoundRobin(RoundRobin::new())
    } else {
        Strategy::WeightedRoundRobin(WeightedRoundRobin::from_snapshot(snapshot))
    }
}
