// src/load_balancer/handle.rs
use super::Strategy;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Atomically swappable slot holding the current strategy.
///
/// Selection callers take an `Arc` snapshot with [`StrategyHandle::current`]
/// and finish against it even if a swap lands mid-call; the replaced
/// instance is dropped once the last such snapshot goes away.
#[derive(Debug)]
pub struct StrategyHandle {
    current: ArcSwap<Strategy>,
}

impl StrategyHandle {
    pub fn new(initial: Strategy) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn current(&self) -> Arc<Strategy> {
        self.current.load_full()
    }

    /// Install `next` and hand back the instance it replaced.
    pub fn swap(&self, next: Strategy) -> Arc<Strategy> {
        self.current.swap(Arc::new(next))
    }
}

impl Default for StrategyHandle {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}
