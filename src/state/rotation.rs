//! The rotation sub-state-machine (spec.md §4.5.3, §9).
//!
//! A tagged variant for `RotationPhase` with explicit transitions, rather
//! than string comparisons. `visited_ags` plus `ag_hop_target` together form
//! the AG-phase sub-state machine and are never collapsed into one counter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Where a student currently is (or is headed) in the rotation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    Heimatraum,
    Ag,
    Schulhof,
}

impl RotationPhase {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "heimatraum" => Some(Self::Heimatraum),
            "ag" => Some(Self::Ag),
            "schulhof" => Some(Self::Schulhof),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Heimatraum => "heimatraum",
            Self::Ag => "ag",
            Self::Schulhof => "schulhof",
        }
    }
}

/// Draw a fresh AG-hop target uniformly from `[min, max]` (inclusive).
pub fn fresh_ag_hop_target(rng: &mut impl Rng, min: u32, max: u32) -> u32 {
    if min >= max {
        return min;
    }
    rng.gen_range(min..=max)
}

/// The mutable rotation-relevant fields of a `StudentState`. Kept as a
/// sub-struct so the check-in/check-out transition functions can operate on
/// it without touching identity or session-visit bookkeeping.
#[derive(Debug, Clone)]
pub struct RotationState {
    pub current_phase: RotationPhase,
    pub next_phase: RotationPhase,
    pub current_room_id: Option<i64>,
    pub visited_ags: HashMap<i64, DateTime<Utc>>,
    pub ag_hop_count: u32,
    pub ag_hop_target: u32,
    pub home_room_id: Option<i64>,
    pub home_device_id: String,
}

impl RotationState {
    /// Apply the check-in transition (spec.md §4.5.3) for entering `room` in
    /// `phase`, from device `device_id`, at time `now`. `fresh_hop_target` is
    /// a hop target drawn by the caller ahead of time — callers that hold a
    /// state-store lock while calling this must never draw from the RNG
    /// inside that lock (spec.md §5 lock order), so the draw happens before
    /// the call and is only used here if this transition turns out to need
    /// one.
    pub fn on_check_in(&mut self, phase: RotationPhase, room: i64, device_id: &str, now: DateTime<Utc>, fresh_hop_target: u32) {
        self.current_phase = phase;
        self.current_room_id = Some(room);

        match phase {
            RotationPhase::Ag => {
                if !self.visited_ags.contains_key(&room) {
                    self.ag_hop_count += 1;
                }
                self.visited_ags.insert(room, now);
                if self.ag_hop_target == 0 {
                    self.ag_hop_target = fresh_hop_target;
                }
                self.next_phase = if self.ag_hop_count >= self.ag_hop_target {
                    RotationPhase::Schulhof
                } else {
                    RotationPhase::Ag
                };
            }
            RotationPhase::Heimatraum => {
                self.ag_hop_count = 0;
                self.visited_ags.clear();
                self.ag_hop_target = fresh_hop_target;
                self.next_phase = RotationPhase::Ag;
                self.home_room_id = Some(room);
                self.home_device_id = device_id.to_string();
            }
            RotationPhase::Schulhof => {
                self.next_phase = RotationPhase::Heimatraum;
            }
        }
    }

    /// Apply the check-out transition (spec.md §4.5.3) leaving `phase`. See
    /// `on_check_in` for why `fresh_hop_target` is drawn by the caller.
    pub fn on_check_out(&mut self, phase: RotationPhase, fresh_hop_target: u32) {
        self.current_room_id = None;

        match phase {
            RotationPhase::Ag => {
                self.next_phase = if self.ag_hop_count >= self.ag_hop_target {
                    RotationPhase::Schulhof
                } else {
                    RotationPhase::Ag
                };
            }
            RotationPhase::Schulhof => {
                self.next_phase = RotationPhase::Heimatraum;
                self.ag_hop_count = 0;
                self.visited_ags.clear();
                self.ag_hop_target = fresh_hop_target;
            }
            RotationPhase::Heimatraum => {
                self.next_phase = RotationPhase::Ag;
            }
        }
    }
}
