// src/load_balancer/least_conn.rs
//! Least-connections selection over a snapshot taken when the strategy was
//! built. The snapshot is not refreshed between swaps.

use crate::proxy::{BackendEndpoint, RegistrySnapshot};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct LeastConnections {
    snapshot: HashMap<BackendEndpoint, usize>,
}

impl LeastConnections {
    pub fn new(snapshot: HashMap<BackendEndpoint, usize>) -> Self {
        Self { snapshot }
    }

    pub fn from_snapshot(snapshot: &RegistrySnapshot) -> Self {
        Self::new(
            snapshot
                .backends
                .iter()
                .map(|(ep, state)| (ep.clone(), state.active_connections))
                .collect(),
        )
    }

    /// Ties go to the earliest position in `eligible`; backends missing from
    /// the snapshot are skipped.
    pub fn select_server(&self, eligible: &[BackendEndpoint]) -> Option<BackendEndpoint> {
        let mut best: Option<(&BackendEndpoint, usize)> = None;

        for endpoint in eligible {
            let Some(&connections) = self.snapshot.get(endpoint) else {
                tracing::debug!(backend = %endpoint, "no connection count in snapshot, skipping");
                continue;
            };
            if best.map_or(true, |(_, min)| connections < min) {
                best = Some((endpoint, connections));
            }
        }

        best.map(|(endpoint, _)| endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> BackendEndpoint {
        s.parse().unwrap()
    }

    fn strategy(counts: &[(&str, usize)]) -> LeastConnections {
        LeastConnections::new(counts.iter().map(|(e, c)| (ep(e), *c)).collect())
    }

    #[test]
    fn test_picks_fewest_connections() {
        let lc = strategy(&[("a:1", 2), ("b:1", 0), ("c:1", 1)]);
        let eligible = vec![ep("a:1"), ep("b:1"), ep("c:1")];

        assert_eq!(lc.select_server(&eligible), Some(ep("b:1")));
        // snapshot-based, so repeated calls agree
        assert_eq!(lc.select_server(&eligible), Some(ep("b:1")));
    }

    #[test]
    fn test_ties_go_to_earliest() {
        let lc = strategy(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        assert_eq!(lc.select_server(&[ep("c:1"), ep("b:1")]), Some(ep("c:1")));
    }

    #[test]
    fn test_missing_entries_are_skipped() {
        let lc = strategy(&[("a:1", 4)]);
        assert_eq!(lc.select_server(&[ep("z:1"), ep("a:1")]), Some(ep("a:1")));
        assert_eq!(lc.select_server(&[ep("z:1")]), None);
        assert_eq!(lc.select_server(&[]), None);
    }

    #[test]
    fn test_only_considers_supplied_eligible() {
        let lc = strategy(&[("a:1", 3), ("b:1", 0)]);
        assert_eq!(lc.select_server(&[ep("a:1")]), Some(ep("a:1")));
    }
}
