//! The sync loop (spec.md §4.4).
//!
//! Every `refresh_interval`, refreshes every device's cache in parallel. An
//! initial refresh runs at startup, before the event engine begins ticking.
//! Failure semantics: any transport error aborts that device's refresh for
//! the cycle — the previous state is retained, and the loop never retries
//! faster than the configured interval.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::error::{ErrPartialAuthentication, TransportError};
use crate::state::model::{Activity, DeviceState, Room, StaffState, StudentState, SupervisorAssignment};
use crate::state::rotation::fresh_ag_hop_target;
use crate::state::StateStore;
use crate::transport::{DeviceCredentials, TransportClient};

/// Devices must wait at least this long between `StartSession` attempts
/// (spec.md §4.4 step 11, §9 "session-start debounce").
const SESSION_START_DEBOUNCE: chrono::Duration = chrono::Duration::seconds(30);

pub struct SyncLoop {
    config: Arc<Config>,
    transport: Arc<TransportClient>,
    store: Arc<StateStore>,
    rng: Mutex<rand::rngs::StdRng>,
}

impl SyncLoop {
    pub fn new(config: Arc<Config>, transport: Arc<TransportClient>, store: Arc<StateStore>) -> Self {
        SyncLoop { config, transport, store, rng: Mutex::new(rand::rngs::StdRng::from_entropy()) }
    }

    fn credentials(&self, device: &DeviceConfig) -> DeviceCredentials {
        DeviceCredentials { api_key: device.api_key.clone(), device_pin: self.config.device_pin.clone() }
    }

    /// Authenticate every configured device once. Used at bootstrap to
    /// decide whether the process should continue (spec.md §6.3, §7.3).
    pub async fn bootstrap_authenticate(&self) -> Result<(), ErrPartialAuthentication> {
        let mut failures = HashMap::new();
        for device in &self.config.devices {
            let creds = self.credentials(device);
            if let Err(e) = self.transport.authenticate(&creds).await {
                warn!(device_id = %device.device_id, error = %e, "authenticate failed during bootstrap");
                failures.insert(device.device_id.clone(), e);
            } else {
                info!(device_id = %device.device_id, "authenticate ok");
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ErrPartialAuthentication { attempted: self.config.devices.len(), failures })
        }
    }

    /// Refresh every device concurrently: fans out one Tokio task per
    /// device and joins them before returning. Runs once at startup and
    /// then on every `refresh_interval` tick.
    pub async fn refresh_all(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(self.config.devices.len());
        for device in self.config.devices.clone() {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.refresh_device(&device).await }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "refresh task panicked");
            }
        }
    }

    async fn refresh_device(&self, device: &DeviceConfig) {
        let creds = self.credentials(device);
        let previous = self.store.snapshot(&device.device_id).await.unwrap_or_else(|| DeviceState::new(device.device_id.clone()));

        let new_state = match self.fetch_and_build(device, &creds, &previous).await {
            Ok(state) => state,
            Err(e) => {
                warn!(device_id = %device.device_id, error = %e, "refresh failed, retaining previous state");
                return;
            }
        };

        self.store.commit(&device.device_id, new_state).await;

        self.maybe_start_default_session(device, &creds).await;
    }

    async fn fetch_and_build(
        &self,
        device: &DeviceConfig,
        creds: &DeviceCredentials,
        previous: &DeviceState,
    ) -> Result<DeviceState, TransportError> {
        let session_payload = self.transport.fetch_session(creds).await?;
        let rooms_payload = self.transport.fetch_rooms(creds).await?;
        let activities_payload = self.transport.fetch_activities(creds).await?;
        let students_payload = self.transport.fetch_students(creds, &device.teacher_ids).await?;

        let needs_teachers = !device.teacher_ids.is_empty() || device.default_session.is_some();
        let teachers_payload = if needs_teachers { self.transport.fetch_teachers(creds).await? } else { vec![] };

        let mut state = DeviceState::new(device.device_id.clone());
        state.session.is_active = session_payload.is_active;
        state.session.room_id = session_payload.room_id;
        state.session.active_group_id = session_payload.active_group_id;
        state.session.room_name = session_payload.room_name;

        state.rooms = rooms_payload.iter().map(|r| Room { id: r.id, name: r.name.clone() }).collect();
        state.rooms_by_id = state.rooms.iter().map(|r| (r.id, r.clone())).collect();

        state.activities = activities_payload.iter().map(|a| Activity { id: a.id, name: a.name.clone() }).collect();
        state.activities_by_id = state.activities.iter().map(|a| (a.id, a.clone())).collect();

        state.active_supervisors = previous.active_supervisors.clone();

        let (min_hops, max_hops) = (self.config.event.rotation.min_ag_hops, self.config.event.rotation.max_ag_hops);
        {
            let mut rng = self.rng.lock().await;
            for s in &students_payload {
                state.students.push(s.student_id);
                let mut fresh = StudentState::new_from_roster(
                    s.student_id,
                    s.person_id,
                    s.first_name.clone(),
                    s.last_name.clone(),
                    s.rfid_tag.clone(),
                    fresh_ag_hop_target(&mut *rng, min_hops, max_hops),
                );
                if let Some(prev_student) = previous.student_states.get(&s.student_id) {
                    fresh.overlay_from_previous(prev_student);
                    if fresh.rotation.ag_hop_target == 0 {
                        fresh.rotation.ag_hop_target = fresh_ag_hop_target(&mut *rng, min_hops, max_hops);
                    }
                }
                state.student_states.insert(s.student_id, fresh);
            }
        }

        self.build_staff_roster(&mut state, previous, &teachers_payload, device);
        self.seed_active_supervisors(&mut state, device);
        state.drop_supervisors_not_in_roster();

        state.session_managed = previous.session_managed;
        state.managed_session_id = previous.managed_session_id;
        state.last_session_start_attempt = previous.last_session_start_attempt;
        state.last_refreshed = Some(Utc::now());

        Ok(state)
    }

    /// Sync loop step 6-7: build `StaffRoster`, carrying over `is_lead` from
    /// the previous entry; the default session's first supervisor id is
    /// hinted as lead; if nobody is flagged lead, promote the smallest id.
    fn build_staff_roster(
        &self,
        state: &mut DeviceState,
        previous: &DeviceState,
        teachers: &[crate::transport::TeacherPayload],
        device: &DeviceConfig,
    ) {
        let lead_hint = device.default_session.as_ref().and_then(|s| s.supervisor_ids.first().copied());

        for t in teachers {
            let is_lead = previous
                .staff_roster
                .get(&t.staff_id)
                .map(|prev| prev.is_lead)
                .unwrap_or(false)
                || lead_hint == Some(t.staff_id);
            state.staff_roster.insert(
                t.staff_id,
                StaffState {
                    staff_id: t.staff_id,
                    person_id: t.person_id,
                    first_name: t.first_name.clone(),
                    last_name: t.last_name.clone(),
                    is_lead,
                    last_active: Utc::now(),
                },
            );
        }

        if !state.staff_roster.is_empty() && !state.staff_roster.values().any(|s| s.is_lead) {
            if let Some(smallest) = state.staff_roster.keys().min().copied() {
                if let Some(entry) = state.staff_roster.get_mut(&smallest) {
                    entry.is_lead = true;
                }
            }
        }
    }

    /// Sync loop step 8: if `ActiveSupervisors` is empty and a default
    /// session exists, seed it from `default_session.supervisor_ids`.
    fn seed_active_supervisors(&self, state: &mut DeviceState, device: &DeviceConfig) {
        if !state.active_supervisors.is_empty() {
            return;
        }
        let Some(default_session) = &device.default_session else { return };
        if default_session.supervisor_ids.is_empty() {
            return;
        }
        let lead_hint = default_session.supervisor_ids.first().copied();
        let now = Utc::now();
        for id in &default_session.supervisor_ids {
            let is_lead = lead_hint == Some(*id);
            state.active_supervisors.insert(*id, SupervisorAssignment { staff_id: *id, is_lead, last_updated: now });
        }
    }

    /// Sync loop step 11: if the device has a default session and no
    /// session is currently active, and the debounce window has elapsed,
    /// attempt `StartSession`.
    async fn maybe_start_default_session(&self, device: &DeviceConfig, creds: &DeviceCredentials) {
        let Some(default_session) = &device.default_session else { return };

        let snapshot = match self.store.snapshot(&device.device_id).await {
            Some(s) => s,
            None => return,
        };
        if snapshot.session.is_active_with_room() {
            return;
        }

        let now = Utc::now();
        if let Some(last_attempt) = snapshot.last_session_start_attempt {
            if now - last_attempt < SESSION_START_DEBOUNCE {
                return;
            }
        }

        self.store.mutate(&device.device_id, |s| s.last_session_start_attempt = Some(now)).await;

        let supervisor_ids = if default_session.supervisor_ids.is_empty() { None } else { Some(default_session.supervisor_ids.as_slice()) };

        match self
            .transport
            .start_session(creds, default_session.activity_id, default_session.room_id, supervisor_ids)
            .await
        {
            Ok(resp) => {
                info!(device_id = %device.device_id, session_id = resp.session_id, "default session started");
                let device_id = device.device_id.clone();
                self.store
                    .mutate(&device_id, |s| {
                        s.session_managed = true;
                        s.managed_session_id = Some(resp.session_id);
                    })
                    .await;

                if let Ok(session) = self.transport.fetch_session(creds).await {
                    self.store
                        .mutate(&device_id, |s| {
                            s.session.is_active = session.is_active;
                            s.session.room_id = session.room_id;
                            s.session.active_group_id = session.active_group_id;
                            s.session.room_name = session.room_name;
                        })
                        .await;
                }
            }
            Err(e) => {
                error!(device_id = %device.device_id, error = %e, "default session start failed, will retry next refresh once debounce elapses");
            }
        }
    }
}

/// Run the sync loop until `shutdown` fires: an immediate refresh, then one
/// every `refresh_interval`. Mirrors `connectivity::run_monitor`'s shape — a
/// `tokio::time::interval` loop that never overlaps itself.
pub async fn run(sync: Arc<SyncLoop>, shutdown: Arc<tokio::sync::Notify>) {
    sync.refresh_all().await;
    info!("initial sync complete");

    let mut interval = tokio::time::interval(sync.config.refresh_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sync.refresh_all().await;
            }
            _ = shutdown.notified() => {
                info!("sync loop shutting down");
                break;
            }
        }
    }
}
