//! Per-device and per-student state (spec.md §3.1).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::rotation::{RotationPhase, RotationState};

/// Server-side session record cached per device.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub is_active: bool,
    pub room_id: Option<i64>,
    pub active_group_id: Option<i64>,
    pub room_name: Option<String>,
}

impl Session {
    /// I1's session-level precondition: active iff `is_active` and a room
    /// is attached.
    pub fn is_active_with_room(&self) -> bool {
        self.is_active && self.room_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub id: i64,
    pub name: String,
}

/// Mutable per-student rotation state (spec.md §3.1 `StudentState`).
#[derive(Debug, Clone)]
pub struct StudentState {
    pub student_id: i64,
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub rfid_tag: String,

    pub rotation: RotationState,

    /// Mirrors the server's "visit open" state. Invariant I1:
    /// `current_room_id.is_some() == has_active_visit`.
    pub has_active_visit: bool,
    pub visit_cooldown_until: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub attendance_status: Option<String>,
    pub last_attendance: Option<DateTime<Utc>>,
}

impl StudentState {
    /// Construct a fresh `StudentState` from a roster entry, with no
    /// rotation history (used on first refresh for a never-before-seen
    /// student).
    pub fn new_from_roster(
        student_id: i64,
        person_id: i64,
        first_name: String,
        last_name: String,
        rfid_tag: String,
        ag_hop_target: u32,
    ) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        StudentState {
            student_id,
            person_id,
            first_name,
            last_name,
            rfid_tag,
            rotation: RotationState {
                current_phase: RotationPhase::Heimatraum,
                next_phase: RotationPhase::Ag,
                current_room_id: None,
                visited_ags: HashMap::new(),
                ag_hop_count: 0,
                ag_hop_target,
                home_room_id: None,
                home_device_id: String::new(),
            },
            has_active_visit: false,
            visit_cooldown_until: epoch,
            last_event_at: epoch,
            attendance_status: None,
            last_attendance: None,
        }
    }

    /// Overlay this student's rotation/activity fields onto a freshly
    /// constructed roster entry (sync loop step 5): the server roster
    /// overlays identity fields, the engine overlays rotation fields.
    pub fn overlay_from_previous(&mut self, previous: &StudentState) {
        self.rotation = previous.rotation.clone();
        self.has_active_visit = previous.has_active_visit;
        self.visit_cooldown_until = previous.visit_cooldown_until;
        self.last_event_at = previous.last_event_at;
        self.attendance_status = previous.attendance_status.clone();
        self.last_attendance = previous.last_attendance;
    }
}

#[derive(Debug, Clone)]
pub struct StaffState {
    pub staff_id: i64,
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub is_lead: bool,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SupervisorAssignment {
    pub staff_id: i64,
    pub is_lead: bool,
    pub last_updated: DateTime<Utc>,
}

/// One `DeviceState` per configured device (spec.md §3.1).
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub device_id: String,
    pub session: Session,
    pub students: Vec<i64>,
    pub rooms: Vec<Room>,
    pub activities: Vec<Activity>,
    pub rooms_by_id: HashMap<i64, Room>,
    pub activities_by_id: HashMap<i64, Activity>,
    pub student_states: HashMap<i64, StudentState>,
    pub staff_roster: HashMap<i64, StaffState>,
    pub active_supervisors: HashMap<i64, SupervisorAssignment>,

    pub session_managed: bool,
    pub managed_session_id: Option<i64>,
    pub last_session_start_attempt: Option<DateTime<Utc>>,

    pub last_refreshed: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn new(device_id: String) -> Self {
        DeviceState {
            device_id,
            ..Default::default()
        }
    }

    /// I5: at least one lead supervisor is required for attendance actions.
    pub fn has_lead_supervisor(&self) -> bool {
        self.active_supervisors.values().any(|a| a.is_lead)
    }

    /// I6: every active-supervisor entry must reference a roster member.
    pub fn drop_supervisors_not_in_roster(&mut self) {
        self.active_supervisors.retain(|staff_id, _| self.staff_roster.contains_key(staff_id));
    }
}
