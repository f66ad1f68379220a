//! End-to-end event-engine scenarios (spec.md §8, scenarios 2-6) against a
//! wiremock-backed fake backend. Each test drives one `ActionExecutor`
//! method directly rather than going through the weighted tick loop, so the
//! assertions stay focused on one action's contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iot_traffic_simulator::config::{ActionConfig, ActionType, Config, DeviceConfig, EventConfig, RotationConfig};
use iot_traffic_simulator::engine::actions::{ActionExecutor, ExecutionOutcome};
use iot_traffic_simulator::state::model::{DeviceState, Session, StaffState, StudentState, SupervisorAssignment};
use iot_traffic_simulator::state::rotation::{RotationPhase, RotationState};
use iot_traffic_simulator::state::StateStore;
use iot_traffic_simulator::transport::TransportClient;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tokio::sync::Mutex;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn success(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "status": "success", "data": data, "message": "" }))
}

fn error(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "status": "error", "data": null, "message": message }))
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn test_config(base_url: String, actions: Vec<ActionConfig>) -> Config {
    Config {
        base_url,
        refresh_interval: Duration::from_secs(60),
        event: EventConfig {
            interval: Duration::from_secs(5),
            max_events_per_tick: 1,
            rotation: RotationConfig {
                order: vec![RotationPhase::Heimatraum, RotationPhase::Ag, RotationPhase::Schulhof],
                min_ag_hops: 2,
                max_ag_hops: 2,
            },
            actions,
        },
        devices: vec![DeviceConfig { device_id: "dev-1".into(), api_key: "key-1".into(), teacher_ids: vec![], default_session: None }],
        device_pin: "pin".into(),
    }
}

fn active_session(room_id: i64) -> Session {
    Session { is_active: true, room_id: Some(room_id), active_group_id: Some(500), room_name: Some("Room".into()) }
}

fn student(rotation: RotationState, rfid: &str) -> StudentState {
    StudentState {
        student_id: 1,
        person_id: 1,
        first_name: "A".into(),
        last_name: "B".into(),
        rfid_tag: rfid.into(),
        rotation,
        has_active_visit: false,
        visit_cooldown_until: epoch(),
        last_event_at: epoch(),
        attendance_status: None,
        last_attendance: None,
    }
}

fn rng() -> Mutex<StdRng> {
    Mutex::new(StdRng::seed_from_u64(7))
}

fn checkin_entry() -> ActionConfig {
    ActionConfig { action_type: ActionType::CheckIn, weight: 1.0, device_ids: vec![] }
}

// Scenario 2: check-in into the `ag` phase records the visit and advances
// the AG-hop sub-state-machine.
#[tokio::test]
async fn checkin_to_ag_room_advances_rotation() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/api/iot/checkin"))
        .respond_with(success(json!({ "status": "confirmed" })))
        .mount(&server).await;

    let config = Arc::new(test_config(server.uri(), vec![checkin_entry()]));
    let transport = TransportClient::new(config.base_url.clone()).unwrap();
    let store = StateStore::new(vec!["dev-1".to_string()]);

    let mut state = DeviceState::new("dev-1".to_string());
    state.session = active_session(10);
    let rotation = RotationState {
        current_phase: RotationPhase::Heimatraum,
        next_phase: RotationPhase::Ag,
        current_room_id: None,
        visited_ags: HashMap::new(),
        ag_hop_count: 0,
        ag_hop_target: 2,
        home_room_id: Some(1),
        home_device_id: "dev-1".into(),
    };
    state.student_states.insert(1, student(rotation, "rfid-a"));
    store.commit("dev-1", state).await;

    let executor = ActionExecutor { config: &config, transport: &transport, store: &store };
    let outcome = executor.execute_checkin(&checkin_entry(), &rng()).await;
    assert!(matches!(outcome, ExecutionOutcome::Success));

    let after = store.snapshot("dev-1").await.unwrap();
    let s = &after.student_states[&1];
    assert_eq!(s.rotation.current_room_id, Some(10));
    assert_eq!(s.rotation.current_phase, RotationPhase::Ag);
    assert_eq!(s.rotation.ag_hop_count, 1);
    assert!(s.rotation.visited_ags.contains_key(&10));
    assert_eq!(s.rotation.next_phase, RotationPhase::Ag);
    assert!(s.has_active_visit);
}

// Scenario 3: a duplicate check-in error repairs `has_active_visit` and
// starts the cooldown, recording the room the device attempted (required by
// I1); the next checkout succeeds.
#[tokio::test]
async fn duplicate_checkin_repairs_state_then_checkout_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/api/iot/checkin")).and(body_partial_json(json!({ "action": "checkin" })))
        .respond_with(error("student already has an active visit"))
        .mount(&server).await;
    Mock::given(method("POST")).and(path("/api/iot/checkin")).and(body_partial_json(json!({ "action": "checkout" })))
        .respond_with(success(json!({ "status": "confirmed" })))
        .mount(&server).await;

    let config = Arc::new(test_config(server.uri(), vec![]));
    let transport = TransportClient::new(config.base_url.clone()).unwrap();
    let store = StateStore::new(vec!["dev-1".to_string()]);

    let mut state = DeviceState::new("dev-1".to_string());
    state.session = active_session(10);
    let rotation = RotationState {
        current_phase: RotationPhase::Heimatraum,
        next_phase: RotationPhase::Ag,
        current_room_id: None,
        visited_ags: HashMap::new(),
        ag_hop_count: 0,
        ag_hop_target: 2,
        home_room_id: Some(1),
        home_device_id: "dev-1".into(),
    };
    state.student_states.insert(1, student(rotation, "rfid-a"));
    store.commit("dev-1", state).await;

    let checkin = checkin_entry();
    let checkout = ActionConfig { action_type: ActionType::CheckOut, weight: 1.0, device_ids: vec![] };

    let executor = ActionExecutor { config: &config, transport: &transport, store: &store };
    let outcome = executor.execute_checkin(&checkin, &rng()).await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)));

    let mid = store.snapshot("dev-1").await.unwrap();
    let s = &mid.student_states[&1];
    assert!(s.has_active_visit);
    assert!(s.visit_cooldown_until > epoch());
    assert_eq!(s.rotation.current_room_id, Some(10), "I1 requires the room to be recorded once has_active_visit is true");

    store.mutate("dev-1", |s| {
        let st = s.student_states.get_mut(&1).unwrap();
        st.visit_cooldown_until = epoch();
        st.last_event_at = epoch() - chrono::Duration::hours(1);
    }).await;

    let outcome = executor.execute_checkout(&checkout, &rng()).await;
    assert!(matches!(outcome, ExecutionOutcome::Success));
    let after = store.snapshot("dev-1").await.unwrap();
    assert!(after.student_states[&1].rotation.current_room_id.is_none());
    assert!(!after.student_states[&1].has_active_visit);
}

// Scenario 4: attendance has zero candidates when no supervisor is lead,
// even though every other predicate holds.
#[tokio::test]
async fn attendance_toggle_requires_a_lead_supervisor() {
    let config = Arc::new(test_config("http://example.invalid".into(), vec![]));
    let transport = TransportClient::new(config.base_url.clone()).unwrap();
    let store = StateStore::new(vec!["dev-1".to_string()]);

    let mut state = DeviceState::new("dev-1".to_string());
    state.session = active_session(10);
    state.active_supervisors.insert(9, SupervisorAssignment { staff_id: 9, is_lead: false, last_updated: Utc::now() });

    let rotation = RotationState {
        current_phase: RotationPhase::Heimatraum,
        next_phase: RotationPhase::Ag,
        current_room_id: Some(10),
        visited_ags: HashMap::new(),
        ag_hop_count: 0,
        ag_hop_target: 2,
        home_room_id: Some(10),
        home_device_id: "dev-1".into(),
    };
    let mut s = student(rotation, "rfid-a");
    s.has_active_visit = true;
    state.student_states.insert(1, s);
    store.commit("dev-1", state).await;

    let entry = ActionConfig { action_type: ActionType::AttendanceToggle, weight: 1.0, device_ids: vec![] };
    let executor = ActionExecutor { config: &config, transport: &transport, store: &store };
    let outcome = executor.execute_attendance_toggle(&entry, &rng()).await;
    assert!(matches!(outcome, ExecutionOutcome::Skipped));
}

// Scenario 5: supervisor swap replaces a non-lead member, keeps the lead,
// and leaves the assigned count unchanged.
#[tokio::test]
async fn supervisor_swap_preserves_lead_and_set_size() {
    let server = MockServer::start().await;
    Mock::given(method("PUT")).and(path("/api/iot/session/500/supervisors"))
        .respond_with(success(json!({ "supervisor_ids": [1, 3] })))
        .mount(&server).await;

    let config = Arc::new(test_config(server.uri(), vec![]));
    let transport = TransportClient::new(config.base_url.clone()).unwrap();
    let store = StateStore::new(vec!["dev-1".to_string()]);

    let mut state = DeviceState::new("dev-1".to_string());
    state.session = active_session(10);
    state.active_supervisors.insert(1, SupervisorAssignment { staff_id: 1, is_lead: true, last_updated: Utc::now() });
    state.active_supervisors.insert(2, SupervisorAssignment { staff_id: 2, is_lead: false, last_updated: Utc::now() });
    for id in [1, 2, 3, 4, 5] {
        state.staff_roster.insert(id, StaffState { staff_id: id, person_id: id, first_name: "S".into(), last_name: id.to_string(), is_lead: id == 1, last_active: Utc::now() });
    }
    store.commit("dev-1", state).await;

    let entry = ActionConfig { action_type: ActionType::SupervisorSwap, weight: 1.0, device_ids: vec![] };
    let executor = ActionExecutor { config: &config, transport: &transport, store: &store };
    let outcome = executor.execute_supervisor_swap(&entry, &rng()).await;
    assert!(matches!(outcome, ExecutionOutcome::Success));

    let after = store.snapshot("dev-1").await.unwrap();
    assert_eq!(after.active_supervisors.len(), 2);
    assert!(after.active_supervisors.values().any(|a| a.is_lead));
    assert!(after.active_supervisors.contains_key(&1));
}

// Scenario 6: a schulhof hop cycle — check in, then check out — resets the
// AG sub-state and lands back at next_phase=heimatraum.
#[tokio::test]
async fn schulhof_hop_cycle_resets_ag_substate() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/api/iot/checkin")).and(body_partial_json(json!({ "action": "checkin" })))
        .respond_with(success(json!({ "status": "confirmed" })))
        .mount(&server).await;
    Mock::given(method("POST")).and(path("/api/iot/checkin")).and(body_partial_json(json!({ "action": "checkout" })))
        .respond_with(success(json!({ "status": "confirmed" })))
        .mount(&server).await;

    let config = Arc::new(test_config(server.uri(), vec![]));
    let transport = TransportClient::new(config.base_url.clone()).unwrap();
    let store = StateStore::new(vec!["dev-1".to_string()]);

    let mut state = DeviceState::new("dev-1".to_string());
    state.session = active_session(10);
    let rotation = RotationState {
        current_phase: RotationPhase::Ag,
        next_phase: RotationPhase::Schulhof,
        current_room_id: None,
        visited_ags: HashMap::from([(11, epoch()), (12, epoch())]),
        ag_hop_count: 2,
        ag_hop_target: 2,
        home_room_id: Some(1),
        home_device_id: "dev-1".into(),
    };
    state.student_states.insert(1, student(rotation, "rfid-a"));
    store.commit("dev-1", state).await;

    let entry = ActionConfig { action_type: ActionType::SchulhofHop, weight: 1.0, device_ids: vec![] };
    let executor = ActionExecutor { config: &config, transport: &transport, store: &store };

    let hop_in = executor.execute_schulhof_hop(&entry, &rng()).await;
    assert!(matches!(hop_in, ExecutionOutcome::Success));
    let mid = store.snapshot("dev-1").await.unwrap();
    assert_eq!(mid.student_states[&1].rotation.current_room_id, Some(10));
    assert_eq!(mid.student_states[&1].rotation.current_phase, RotationPhase::Schulhof);

    store.mutate("dev-1", |s| {
        s.student_states.get_mut(&1).unwrap().visit_cooldown_until = epoch();
    }).await;

    let hop_out = executor.execute_schulhof_hop(&entry, &rng()).await;
    assert!(matches!(hop_out, ExecutionOutcome::Success));

    let after = store.snapshot("dev-1").await.unwrap();
    let s = &after.student_states[&1];
    assert!(s.rotation.current_room_id.is_none());
    assert_eq!(s.rotation.next_phase, RotationPhase::Heimatraum);
    assert_eq!(s.rotation.ag_hop_count, 0);
    assert!(s.rotation.visited_ags.is_empty());
}
