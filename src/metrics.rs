//! Per-action success/failure counters (spec.md §4.5.1, §7).
//!
//! Its own mutex, separate from the state lock and the RNG's mutex. Lock
//! order, when more than one is ever held, is: state lock -> metrics/RNG
//! mutexes, never the reverse (spec.md §5).

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::config::ActionType;

#[derive(Debug, Clone, Copy, Default)]
pub struct ActionCounts {
    pub successes: u64,
    pub failures: u64,
}

#[derive(Default)]
pub struct ActionMetrics {
    counts: Mutex<HashMap<ActionType, ActionCounts>>,
}

impl ActionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, action: ActionType) {
        self.counts.lock().await.entry(action).or_default().successes += 1;
    }

    pub async fn record_failure(&self, action: ActionType) {
        self.counts.lock().await.entry(action).or_default().failures += 1;
    }

    pub async fn snapshot(&self) -> HashMap<ActionType, ActionCounts> {
        self.counts.lock().await.clone()
    }
}
