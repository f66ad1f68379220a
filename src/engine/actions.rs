//! Action eligibility and execution (spec.md §4.5.2, §4.5.4).

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::config::{ActionConfig, Config};
use crate::error::EngineError;
use crate::state::model::SupervisorAssignment;
use crate::state::rotation::{fresh_ag_hop_target, RotationPhase};
use crate::state::StateStore;
use crate::transport::{CheckAction, DeviceCredentials, TransportClient};

const COOLDOWN: ChronoDuration = ChronoDuration::seconds(3);

/// What happened when an action was executed this tick.
pub enum ExecutionOutcome {
    /// A candidate was found, the transport call succeeded, state committed.
    Success,
    /// No eligible (device, student) — or device — candidate existed.
    /// Level-1 expected outcome: no metric, no log (spec.md §4.5.1, §7).
    Skipped,
    /// The transport call failed in a way the tick loop should count and
    /// warn about.
    Failed(EngineError),
}

/// A candidate device + optional student for one action attempt.
struct Candidate {
    device_id: String,
    student_id: Option<i64>,
}

pub struct ActionExecutor<'a> {
    pub config: &'a Config,
    pub transport: &'a TransportClient,
    pub store: &'a StateStore,
}

impl<'a> ActionExecutor<'a> {
    fn credentials_for(&self, device_id: &str) -> Option<DeviceCredentials> {
        self.config
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .map(|d| DeviceCredentials { api_key: d.api_key.clone(), device_pin: self.config.device_pin.clone() })
    }

    pub async fn execute_checkin(&self, entry: &ActionConfig, rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> ExecutionOutcome {
        let now = Utc::now();
        let devices = self.store.read().await;
        let mut candidates = Vec::new();
        for (device_id, state) in devices.iter() {
            if !entry.applies_to(device_id) || !state.session.is_active_with_room() {
                continue;
            }
            for (student_id, student) in &state.student_states {
                if student.rfid_tag.is_empty() {
                    continue;
                }
                if student.rotation.current_room_id.is_some() || student.has_active_visit {
                    continue;
                }
                if student.visit_cooldown_until > now {
                    continue;
                }
                if student.rotation.next_phase == RotationPhase::Schulhof {
                    continue;
                }
                if student.rotation.next_phase == RotationPhase::Ag {
                    let room_id = state.session.room_id.unwrap();
                    let already_visited = student.rotation.visited_ags.contains_key(&room_id);
                    let all_activities_visited = !state.activities.is_empty()
                        && student.rotation.visited_ags.len() >= state.activities.len();
                    if already_visited && !all_activities_visited {
                        continue;
                    }
                }
                candidates.push(Candidate { device_id: device_id.clone(), student_id: Some(*student_id) });
            }
        }
        drop(devices);

        let Some(candidate) = pick_one(&candidates, rng).await else { return ExecutionOutcome::Skipped };
        let student_id = candidate.student_id.unwrap();

        let snapshot = match self.store.snapshot(&candidate.device_id).await {
            Some(s) => s,
            None => return ExecutionOutcome::Skipped,
        };
        let Some(room_id) = snapshot.session.room_id else { return ExecutionOutcome::Skipped };
        let Some(student) = snapshot.student_states.get(&student_id) else { return ExecutionOutcome::Skipped };
        let rfid = student.rfid_tag.clone();
        let phase = student.rotation.next_phase;

        let Some(creds) = self.credentials_for(&candidate.device_id) else { return ExecutionOutcome::Skipped };

        match self.transport.perform_check_action(&creds, &rfid, CheckAction::CheckIn, Some(room_id)).await {
            Ok(_) => {
                let (min_hops, max_hops) = (self.config.event.rotation.min_ag_hops, self.config.event.rotation.max_ag_hops);
                // Draw whatever the transition might need before touching the
                // state lock: spec.md §5 requires state lock -> RNG mutex
                // order, never the reverse, and `store.mutate` below takes
                // the state lock.
                let fresh_hop_target = {
                    let mut guard = rng.lock().await;
                    fresh_ag_hop_target(&mut *guard, min_hops, max_hops)
                };
                debug!(student_id, phase = phase.label(), room_id, "check-in");
                self.store
                    .mutate(&candidate.device_id, |s| {
                        if let Some(st) = s.student_states.get_mut(&student_id) {
                            st.rotation.on_check_in(phase, room_id, &candidate.device_id, now, fresh_hop_target);
                            st.has_active_visit = true;
                            st.visit_cooldown_until = now + COOLDOWN;
                            st.last_event_at = now;
                        }
                    })
                    .await;
                ExecutionOutcome::Success
            }
            // spec.md §3.2 I1 requires current_room_id.is_some() whenever
            // has_active_visit is true; the server already holds this visit
            // open in the room we just attempted, so the repair must record
            // the room, not just the flag, or the next tick's checkout can
            // never find this student eligible.
            Err(e) if e.is_already_active_visit() => {
                self.store
                    .mutate(&candidate.device_id, |s| {
                        if let Some(st) = s.student_states.get_mut(&student_id) {
                            st.has_active_visit = true;
                            st.rotation.current_room_id = Some(room_id);
                            st.visit_cooldown_until = now + COOLDOWN;
                            st.last_event_at = now;
                        }
                    })
                    .await;
                ExecutionOutcome::Failed(EngineError::Transport(e))
            }
            Err(e) => ExecutionOutcome::Failed(EngineError::Transport(e)),
        }
    }

    pub async fn execute_checkout(&self, entry: &ActionConfig, rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> ExecutionOutcome {
        let now = Utc::now();
        let half_interval = ChronoDuration::from_std(self.config.event.interval / 2).unwrap_or(ChronoDuration::zero());

        let devices = self.store.read().await;
        let mut candidates = Vec::new();
        for (device_id, state) in devices.iter() {
            if !entry.applies_to(device_id) || !state.session.is_active_with_room() {
                continue;
            }
            for (student_id, student) in &state.student_states {
                if student.rfid_tag.is_empty() {
                    continue;
                }
                if student.rotation.current_room_id.is_none() || !student.has_active_visit {
                    continue;
                }
                if student.visit_cooldown_until > now {
                    continue;
                }
                if student.last_event_at >= now - half_interval {
                    continue;
                }
                candidates.push(Candidate { device_id: device_id.clone(), student_id: Some(*student_id) });
            }
        }
        drop(devices);

        let Some(candidate) = pick_one(&candidates, rng).await else { return ExecutionOutcome::Skipped };
        let student_id = candidate.student_id.unwrap();

        let snapshot = match self.store.snapshot(&candidate.device_id).await {
            Some(s) => s,
            None => return ExecutionOutcome::Skipped,
        };
        let Some(student) = snapshot.student_states.get(&student_id) else { return ExecutionOutcome::Skipped };
        let rfid = student.rfid_tag.clone();
        let phase = student.rotation.current_phase;

        let Some(creds) = self.credentials_for(&candidate.device_id) else { return ExecutionOutcome::Skipped };

        self.run_checkout(&candidate.device_id, student_id, &rfid, phase, &creds, rng).await
    }

    /// Shared checkout execution used by both `checkout` and the checkout
    /// half of `schulhof_hop`.
    async fn run_checkout(
        &self,
        device_id: &str,
        student_id: i64,
        rfid: &str,
        phase: RotationPhase,
        creds: &DeviceCredentials,
        rng: &tokio::sync::Mutex<rand::rngs::StdRng>,
    ) -> ExecutionOutcome {
        let now = Utc::now();
        match self.transport.perform_check_action(creds, rfid, CheckAction::CheckOut, None).await {
            Ok(_) => {
                let (min_hops, max_hops) = (self.config.event.rotation.min_ag_hops, self.config.event.rotation.max_ag_hops);
                let fresh_hop_target = {
                    let mut guard = rng.lock().await;
                    fresh_ag_hop_target(&mut *guard, min_hops, max_hops)
                };
                debug!(student_id, phase = phase.label(), "check-out");
                self.store
                    .mutate(device_id, |s| {
                        if let Some(st) = s.student_states.get_mut(&student_id) {
                            st.rotation.on_check_out(phase, fresh_hop_target);
                            st.has_active_visit = false;
                            st.visit_cooldown_until = now + COOLDOWN;
                            st.last_event_at = now;
                        }
                    })
                    .await;
                ExecutionOutcome::Success
            }
            // spec.md §4.5.4: treat as already closed, repair state, swallow
            // the error — this is a brittle string match on the backend's
            // literal message, preserved because no structured error code
            // exists (spec.md §9).
            Err(e) if e.is_visit_already_closed() => {
                self.store
                    .mutate(device_id, |s| {
                        if let Some(st) = s.student_states.get_mut(&student_id) {
                            st.has_active_visit = false;
                            st.rotation.current_room_id = None;
                            st.visit_cooldown_until = now + COOLDOWN;
                        }
                    })
                    .await;
                ExecutionOutcome::Skipped
            }
            Err(e) => ExecutionOutcome::Failed(EngineError::Transport(e)),
        }
    }

    pub async fn execute_schulhof_hop(&self, entry: &ActionConfig, rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> ExecutionOutcome {
        let now = Utc::now();

        enum Sub {
            CheckOut,
            CheckIn,
        }

        let devices = self.store.read().await;
        let mut candidates: Vec<(Candidate, Sub)> = Vec::new();
        for (device_id, state) in devices.iter() {
            if !entry.applies_to(device_id) || !state.session.is_active_with_room() {
                continue;
            }
            for (student_id, student) in &state.student_states {
                if student.rfid_tag.is_empty() || student.visit_cooldown_until > now {
                    continue;
                }
                if student.rotation.current_phase == RotationPhase::Schulhof && student.has_active_visit {
                    candidates.push((Candidate { device_id: device_id.clone(), student_id: Some(*student_id) }, Sub::CheckOut));
                } else if student.rotation.next_phase == RotationPhase::Schulhof && student.rotation.current_room_id.is_none() {
                    candidates.push((Candidate { device_id: device_id.clone(), student_id: Some(*student_id) }, Sub::CheckIn));
                }
            }
        }
        drop(devices);

        if candidates.is_empty() {
            return ExecutionOutcome::Skipped;
        }
        let idx = {
            let mut guard = rng.lock().await;
            guard.gen_range(0..candidates.len())
        };
        let (candidate, sub) = &candidates[idx];
        let student_id = candidate.student_id.unwrap();

        let snapshot = match self.store.snapshot(&candidate.device_id).await {
            Some(s) => s,
            None => return ExecutionOutcome::Skipped,
        };
        let Some(student) = snapshot.student_states.get(&student_id) else { return ExecutionOutcome::Skipped };
        let rfid = student.rfid_tag.clone();
        let Some(creds) = self.credentials_for(&candidate.device_id) else { return ExecutionOutcome::Skipped };

        match sub {
            Sub::CheckOut => self.run_checkout(&candidate.device_id, student_id, &rfid, RotationPhase::Schulhof, &creds, rng).await,
            Sub::CheckIn => {
                let Some(room_id) = snapshot.session.room_id else { return ExecutionOutcome::Skipped };
                match self.transport.perform_check_action(&creds, &rfid, CheckAction::CheckIn, Some(room_id)).await {
                    Ok(_) => {
                        let (min_hops, max_hops) =
                            (self.config.event.rotation.min_ag_hops, self.config.event.rotation.max_ag_hops);
                        let fresh_hop_target = {
                            let mut guard = rng.lock().await;
                            fresh_ag_hop_target(&mut *guard, min_hops, max_hops)
                        };
                        debug!(student_id, phase = RotationPhase::Schulhof.label(), room_id, "schulhof_hop check-in");
                        let device_id = candidate.device_id.clone();
                        self.store
                            .mutate(&device_id, |s| {
                                if let Some(st) = s.student_states.get_mut(&student_id) {
                                    st.rotation.on_check_in(RotationPhase::Schulhof, room_id, &device_id, now, fresh_hop_target);
                                    st.has_active_visit = true;
                                    st.visit_cooldown_until = now + COOLDOWN;
                                    st.last_event_at = now;
                                }
                            })
                            .await;
                        ExecutionOutcome::Success
                    }
                    Err(e) if e.is_already_active_visit() => {
                        let device_id = candidate.device_id.clone();
                        self.store
                            .mutate(&device_id, |s| {
                                if let Some(st) = s.student_states.get_mut(&student_id) {
                                    st.has_active_visit = true;
                                    st.rotation.current_room_id = Some(room_id);
                                    st.visit_cooldown_until = now + COOLDOWN;
                                    st.last_event_at = now;
                                }
                            })
                            .await;
                        ExecutionOutcome::Failed(EngineError::Transport(e))
                    }
                    Err(e) => ExecutionOutcome::Failed(EngineError::Transport(e)),
                }
            }
        }
    }

    pub async fn execute_attendance_toggle(&self, entry: &ActionConfig, rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> ExecutionOutcome {
        let now = Utc::now();
        let interval = ChronoDuration::from_std(self.config.event.interval).unwrap_or(ChronoDuration::zero());

        let devices = self.store.read().await;
        let mut candidates = Vec::new();
        for (device_id, state) in devices.iter() {
            if !entry.applies_to(device_id) || !state.session.is_active_with_room() || !state.has_lead_supervisor() {
                continue;
            }
            let Some(session_room) = state.session.room_id else { continue };
            for (student_id, student) in &state.student_states {
                if student.rotation.home_room_id != Some(session_room) {
                    continue;
                }
                if !(student.rotation.home_device_id.is_empty() || student.rotation.home_device_id == *device_id) {
                    continue;
                }
                if student.rotation.current_phase != RotationPhase::Heimatraum {
                    continue;
                }
                if student.rotation.current_room_id.is_none() {
                    continue;
                }
                if let Some(last) = student.last_attendance {
                    if now - last < interval {
                        continue;
                    }
                }
                candidates.push(Candidate { device_id: device_id.clone(), student_id: Some(*student_id) });
            }
        }
        drop(devices);

        let Some(candidate) = pick_one(&candidates, rng).await else { return ExecutionOutcome::Skipped };
        let student_id = candidate.student_id.unwrap();

        let snapshot = match self.store.snapshot(&candidate.device_id).await {
            Some(s) => s,
            None => return ExecutionOutcome::Skipped,
        };
        let Some(student) = snapshot.student_states.get(&student_id) else { return ExecutionOutcome::Skipped };
        let rfid = student.rfid_tag.clone();
        let Some(creds) = self.credentials_for(&candidate.device_id) else { return ExecutionOutcome::Skipped };

        match self.transport.toggle_attendance(&creds, &rfid).await {
            Ok(resp) => {
                let device_id = candidate.device_id.clone();
                self.store
                    .mutate(&device_id, |s| {
                        if let Some(st) = s.student_states.get_mut(&student_id) {
                            st.attendance_status = Some(resp.status.clone());
                            st.last_attendance = Some(now);
                        }
                    })
                    .await;
                ExecutionOutcome::Success
            }
            Err(e) => ExecutionOutcome::Failed(EngineError::Transport(e)),
        }
    }

    pub async fn execute_supervisor_swap(&self, entry: &ActionConfig, rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> ExecutionOutcome {
        let devices = self.store.read().await;
        let mut eligible: Vec<(String, i64)> = Vec::new();
        for (device_id, state) in devices.iter() {
            if !entry.applies_to(device_id) || !state.session.is_active_with_room() {
                continue;
            }
            let Some(session_id) = state.session.active_group_id.or(state.managed_session_id) else { continue };
            let has_non_lead = state.active_supervisors.values().any(|a| !a.is_lead);
            let unassigned_available = state.staff_roster.keys().any(|id| !state.active_supervisors.contains_key(id));
            if has_non_lead && unassigned_available {
                eligible.push((device_id.clone(), session_id));
            }
        }
        drop(devices);

        if eligible.is_empty() {
            return ExecutionOutcome::Skipped;
        }
        let idx = {
            let mut guard = rng.lock().await;
            guard.gen_range(0..eligible.len())
        };
        let (device_id, session_id) = eligible[idx].clone();

        let Some(snapshot) = self.store.snapshot(&device_id).await else { return ExecutionOutcome::Skipped };
        let non_lead_ids: Vec<i64> = snapshot.active_supervisors.values().filter(|a| !a.is_lead).map(|a| a.staff_id).collect();
        let unassigned: Vec<i64> =
            snapshot.staff_roster.keys().filter(|id| !snapshot.active_supervisors.contains_key(id)).copied().collect();
        if non_lead_ids.is_empty() || unassigned.is_empty() {
            return ExecutionOutcome::Skipped;
        }

        let (outgoing, incoming) = {
            let mut guard = rng.lock().await;
            let outgoing = *non_lead_ids.choose(&mut *guard).expect("checked non-empty");
            let incoming = *unassigned.choose(&mut *guard).expect("checked non-empty");
            (outgoing, incoming)
        };

        let mut new_ids: Vec<i64> = snapshot.active_supervisors.keys().copied().filter(|id| *id != outgoing).collect();
        new_ids.push(incoming);

        let Some(creds) = self.credentials_for(&device_id) else { return ExecutionOutcome::Skipped };

        match self.transport.update_session_supervisors(&creds, session_id, &new_ids).await {
            Ok(resp) => {
                let now = Utc::now();
                let submitted = if resp.supervisor_ids.is_empty() { new_ids.clone() } else { resp.supervisor_ids.clone() };
                self.store
                    .mutate(&device_id, |s| {
                        s.active_supervisors.retain(|id, _| submitted.contains(id));
                        for id in &submitted {
                            s.active_supervisors.entry(*id).or_insert_with(|| SupervisorAssignment {
                                staff_id: *id,
                                is_lead: false,
                                last_updated: now,
                            });
                        }
                        if !s.active_supervisors.values().any(|a| a.is_lead) {
                            if let Some(assignment) = s.active_supervisors.get_mut(&incoming) {
                                assignment.is_lead = true;
                            }
                        }
                        if let Some(assignment) = s.active_supervisors.get_mut(&incoming) {
                            assignment.last_updated = now;
                        }
                    })
                    .await;
                ExecutionOutcome::Success
            }
            Err(e) => ExecutionOutcome::Failed(EngineError::Transport(e)),
        }
    }
}

/// Pick one candidate uniformly at random under the RNG's own mutex
/// (spec.md §4.5.5 — ties are broken by the RNG, never by iteration order).
async fn pick_one(candidates: &[Candidate], rng: &tokio::sync::Mutex<rand::rngs::StdRng>) -> Option<Candidate> {
    if candidates.is_empty() {
        return None;
    }
    let idx = {
        let mut guard = rng.lock().await;
        guard.gen_range(0..candidates.len())
    };
    Some(Candidate { device_id: candidates[idx].device_id.clone(), student_id: candidates[idx].student_id })
}
