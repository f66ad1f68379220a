//! The event engine: the weighted action scheduler (spec.md §4.5).
//!
//! Every `event.interval`, runs one tick. A tick draws up to
//! `max_events_per_tick` actions, each by an independent weighted random
//! draw over `event.actions`, and executes them one at a time against the
//! shared state store. `ExecutionOutcome::Skipped` (no eligible candidate)
//! is an expected, silent outcome (§4.5.1) — it is not logged and does not
//! move a metric.

pub mod actions;

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ActionConfig, ActionType, Config};
use crate::metrics::ActionMetrics;
use crate::state::StateStore;
use crate::transport::TransportClient;

use actions::{ActionExecutor, ExecutionOutcome};

pub struct EventEngine {
    config: Arc<Config>,
    transport: Arc<TransportClient>,
    store: Arc<StateStore>,
    metrics: Arc<ActionMetrics>,
    rng: Mutex<rand::rngs::StdRng>,
}

impl EventEngine {
    pub fn new(config: Arc<Config>, transport: Arc<TransportClient>, store: Arc<StateStore>, metrics: Arc<ActionMetrics>) -> Self {
        EventEngine { config, transport, store, metrics, rng: Mutex::new(rand::rngs::StdRng::from_entropy()) }
    }

    /// Run one tick: up to `max_events_per_tick` independent weighted draws,
    /// each executed in turn (spec.md §4.5.1 — sequential within a tick, the
    /// concurrency lives in the per-device HTTP calls, not across draws).
    pub async fn tick(&self) {
        for _ in 0..self.config.event.max_events_per_tick {
            let Some(entry) = self.draw_action().await else { continue };
            self.execute(entry).await;
        }
    }

    async fn draw_action(&self) -> Option<ActionConfig> {
        let actions = &self.config.event.actions;
        let total: f64 = actions.iter().map(|a| a.weight).sum();
        if total <= 0.0 {
            return None;
        }
        let draw = {
            let mut guard = self.rng.lock().await;
            guard.gen_range(0.0..total)
        };
        let mut cumulative = 0.0;
        for entry in actions {
            cumulative += entry.weight;
            if draw < cumulative {
                return Some(entry.clone());
            }
        }
        actions.last().cloned()
    }

    async fn execute(&self, entry: ActionConfig) {
        let executor = ActionExecutor { config: &self.config, transport: &self.transport, store: &self.store };
        let action_type = entry.action_type;
        let outcome = match action_type {
            ActionType::CheckIn => executor.execute_checkin(&entry, &self.rng).await,
            ActionType::CheckOut => executor.execute_checkout(&entry, &self.rng).await,
            ActionType::SchulhofHop => executor.execute_schulhof_hop(&entry, &self.rng).await,
            ActionType::AttendanceToggle => executor.execute_attendance_toggle(&entry, &self.rng).await,
            ActionType::SupervisorSwap => executor.execute_supervisor_swap(&entry, &self.rng).await,
        };

        match outcome {
            ExecutionOutcome::Success => {
                self.metrics.record_success(action_type).await;
            }
            ExecutionOutcome::Skipped => {}
            ExecutionOutcome::Failed(err) => {
                self.metrics.record_failure(action_type).await;
                warn!(action = action_type.label(), error = %err, "action tick failed");
            }
        }
    }
}

/// Run the event engine until `shutdown` fires: one tick every
/// `event.interval`.
pub async fn run(engine: Arc<EventEngine>, shutdown: Arc<tokio::sync::Notify>) {
    let mut interval = tokio::time::interval(engine.config.event.interval);
    info!("event engine starting");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.tick().await;
            }
            _ = shutdown.notified() => {
                info!("event engine shutting down");
                break;
            }
        }
    }
}
