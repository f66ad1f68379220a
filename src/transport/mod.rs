//! Stateless HTTP wrapper over the backend's IoT endpoints (spec.md §4.2).
//!
//! Every call is device-scoped: `Authorization: Bearer <api_key>` plus the
//! shared `X-Staff-PIN` header. The client never touches the state store —
//! it only builds requests, sends them, and decodes the common envelope.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

const USER_AGENT: &str = concat!("iot-traffic-simulator/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY_BYTES: usize = 512;

/// The common response envelope every endpoint wraps its payload in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    message: String,
}

// ─── Payload shapes (spec.md §6.2: lowercase snake_case, signed 64-bit ids) ─

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub is_active: bool,
    pub room_id: Option<i64>,
    pub active_group_id: Option<i64>,
    pub room_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudentPayload {
    pub student_id: i64,
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub rfid_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomPayload {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityPayload {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeacherPayload {
    pub staff_id: i64,
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct StartSessionRequest<'a> {
    activity_id: i64,
    room_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    supervisor_ids: Option<&'a [i64]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    CheckIn,
    CheckOut,
}

impl CheckAction {
    fn as_str(self) -> &'static str {
        match self {
            CheckAction::CheckIn => "checkin",
            CheckAction::CheckOut => "checkout",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CheckActionRequest<'a> {
    student_rfid: &'a str,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckActionResponse {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
struct ToggleAttendanceRequest<'a> {
    rfid: &'a str,
    action: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToggleAttendanceResponse {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
struct UpdateSupervisorsRequest<'a> {
    supervisor_ids: &'a [i64],
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSupervisorsResponse {
    #[serde(default)]
    pub supervisor_ids: Vec<i64>,
}

/// Credentials for one device's calls — bearer API key plus the shared PIN.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub api_key: String,
    pub device_pin: String,
}

/// Stateless HTTP transport client. Cheap to clone (wraps an `Arc`-backed
/// `reqwest::Client` internally).
#[derive(Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    base_url: String,
}

impl TransportClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| TransportError::Network { endpoint: "client-build".into(), source })?;
        Ok(TransportClient { http, base_url: base_url.into() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
        creds: &DeviceCredentials,
    ) -> Result<T, TransportError> {
        let response = request
            .bearer_auth(&creds.api_key)
            .header("X-Staff-PIN", &creds.device_pin)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| TransportError::Network { endpoint: endpoint.to_string(), source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| TransportError::Network { endpoint: endpoint.to_string(), source })?;

        if !status.is_success() {
            let mut truncated = body;
            truncated.truncate(MAX_ERROR_BODY_BYTES);
            return Err(TransportError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: truncated,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|source| TransportError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if envelope.status != "success" {
            return Err(TransportError::Server { endpoint: endpoint.to_string(), message: envelope.message });
        }

        envelope.data.ok_or_else(|| TransportError::Server {
            endpoint: endpoint.to_string(),
            message: "success envelope carried no data".to_string(),
        })
    }

    /// `GET /api/iot/status` — success iff the call returns 200.
    pub async fn authenticate(&self, creds: &DeviceCredentials) -> Result<(), TransportError> {
        let endpoint = "/api/iot/status";
        debug!(endpoint, "authenticate");
        let _: serde_json::Value = self.send(endpoint, self.http.get(self.url(endpoint)), creds).await?;
        Ok(())
    }

    pub async fn fetch_session(&self, creds: &DeviceCredentials) -> Result<SessionPayload, TransportError> {
        let endpoint = "/api/iot/session/current";
        self.send(endpoint, self.http.get(self.url(endpoint)), creds).await
    }

    /// `GET /api/iot/students?teacher_ids=...` — empty filter omits the
    /// query parameter entirely, matching "empty when the device has no
    /// teacher filter".
    pub async fn fetch_students(
        &self,
        creds: &DeviceCredentials,
        teacher_ids: &[i64],
    ) -> Result<Vec<StudentPayload>, TransportError> {
        let endpoint = "/api/iot/students";
        let mut req = self.http.get(self.url(endpoint));
        if !teacher_ids.is_empty() {
            let joined = teacher_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
            req = req.query(&[("teacher_ids", joined)]);
        }
        self.send(endpoint, req, creds).await
    }

    pub async fn fetch_rooms(&self, creds: &DeviceCredentials) -> Result<Vec<RoomPayload>, TransportError> {
        let endpoint = "/api/iot/rooms";
        self.send(endpoint, self.http.get(self.url(endpoint)), creds).await
    }

    pub async fn fetch_activities(&self, creds: &DeviceCredentials) -> Result<Vec<ActivityPayload>, TransportError> {
        let endpoint = "/api/iot/activities";
        self.send(endpoint, self.http.get(self.url(endpoint)), creds).await
    }

    pub async fn fetch_teachers(&self, creds: &DeviceCredentials) -> Result<Vec<TeacherPayload>, TransportError> {
        let endpoint = "/api/iot/teachers";
        self.send(endpoint, self.http.get(self.url(endpoint)), creds).await
    }

    pub async fn start_session(
        &self,
        creds: &DeviceCredentials,
        activity_id: i64,
        room_id: i64,
        supervisor_ids: Option<&[i64]>,
    ) -> Result<StartSessionResponse, TransportError> {
        let endpoint = "/api/iot/session/start";
        let body = StartSessionRequest { activity_id, room_id, supervisor_ids };
        self.send(endpoint, self.http.post(self.url(endpoint)).json(&body), creds).await
    }

    pub async fn perform_check_action(
        &self,
        creds: &DeviceCredentials,
        student_rfid: &str,
        action: CheckAction,
        room_id: Option<i64>,
    ) -> Result<CheckActionResponse, TransportError> {
        let endpoint = "/api/iot/checkin";
        let body = CheckActionRequest { student_rfid, action: action.as_str(), room_id };
        self.send(endpoint, self.http.post(self.url(endpoint)).json(&body), creds).await
    }

    pub async fn toggle_attendance(
        &self,
        creds: &DeviceCredentials,
        rfid: &str,
    ) -> Result<ToggleAttendanceResponse, TransportError> {
        let endpoint = "/api/iot/attendance/toggle";
        let body = ToggleAttendanceRequest { rfid, action: "confirm" };
        self.send(endpoint, self.http.post(self.url(endpoint)).json(&body), creds).await
    }

    pub async fn update_session_supervisors(
        &self,
        creds: &DeviceCredentials,
        session_id: i64,
        supervisor_ids: &[i64],
    ) -> Result<UpdateSupervisorsResponse, TransportError> {
        let endpoint_owned = format!("/api/iot/session/{session_id}/supervisors");
        let body = UpdateSupervisorsRequest { supervisor_ids };
        self.send(&endpoint_owned, self.http.put(self.url(&endpoint_owned)).json(&body), creds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> DeviceCredentials {
        DeviceCredentials { api_key: "k".into(), device_pin: "1234".into() }
    }

    #[tokio::test]
    async fn authenticate_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/iot/status"))
            .and(header("Authorization", "Bearer k"))
            .and(header("X-Staff-PIN", "1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success", "data": {}, "message": ""
            })))
            .mount(&server)
            .await;

        let client = TransportClient::new(server.uri()).unwrap();
        client.authenticate(&creds()).await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_failure_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/iot/status"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = TransportClient::new(server.uri()).unwrap();
        let err = client.authenticate(&creds()).await.unwrap_err();
        assert!(matches!(err, TransportError::HttpStatus { status: 401, .. }));
    }

    #[tokio::test]
    async fn server_error_envelope_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/iot/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error", "data": null, "message": "student already has an active visit"
            })))
            .mount(&server)
            .await;

        let client = TransportClient::new(server.uri()).unwrap();
        let err = client
            .perform_check_action(&creds(), "rfid-1", CheckAction::CheckIn, Some(10))
            .await
            .unwrap_err();
        assert!(err.is_already_active_visit());
    }

    #[tokio::test]
    async fn fetch_students_omits_query_when_no_teacher_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/iot/students"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success", "data": [], "message": ""
            })))
            .mount(&server)
            .await;

        let client = TransportClient::new(server.uri()).unwrap();
        let students = client.fetch_students(&creds(), &[]).await.unwrap();
        assert!(students.is_empty());
    }
}
