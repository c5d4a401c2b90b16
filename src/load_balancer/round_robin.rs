// src/load_balancer/round_robin.rs
use crate::proxy::BackendEndpoint;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn select_server(&self, eligible: &[BackendEndpoint]) -> Option<BackendEndpoint> {
        let len = eligible.len();
        if len == 0 {
            return None;
        }

        // The stored cursor is re-reduced against the current length, so a
        // shrinking eligible set can never index out of bounds.
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur % len + 1) % len)
            })
            .unwrap_or_else(|cur| cur);

        Some(eligible[previous % len].clone())
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eps(names: &[&str]) -> Vec<BackendEndpoint> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn test_cycles_in_order() {
        let rr = RoundRobin::new();
        let eligible = eps(&["a:1", "b:1", "c:1"]);

        let picks: Vec<String> = (0..6)
            .map(|_| rr.select_server(&eligible).unwrap().to_string())
            .collect();

        assert_eq!(picks, ["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_empty_eligible() {
        let rr = RoundRobin::new();
        assert!(rr.select_server(&[]).is_none());
        assert_eq!(rr.cursor(), 0);
    }

    #[test]
    fn test_shrinking_eligible_stays_in_range() {
        let rr = RoundRobin::new();
        let three = eps(&["a:1", "b:1", "c:1"]);
        let one = eps(&["b:1"]);

        rr.select_server(&three);
        rr.select_server(&three);
        assert_eq!(rr.cursor(), 2);

        assert_eq!(rr.select_server(&one).unwrap().to_string(), "b:1");
        assert_eq!(rr.cursor(), 0);
    }

    proptest! {
        #[test]
        fn prop_never_leaves_eligible(lens in proptest::collection::vec(1usize..8, 1..40)) {
            let rr = RoundRobin::new();
            for len in lens {
                let eligible: Vec<BackendEndpoint> = (0..len)
                    .map(|i| format!("10.0.0.{i}:80").parse().unwrap())
                    .collect();
                let picked = rr.select_server(&eligible).unwrap();
                prop_assert!(eligible.contains(&picked));
                prop_assert!(rr.cursor() < len);
            }
        }
    }
}
