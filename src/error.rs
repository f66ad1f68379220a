//! Library-level error types.
//!
//! `thiserror` enums sit at module seams so callers can match on a specific
//! variant (`ErrPartialAuthentication`) instead of string-matching. `main.rs`
//! matches on these variants directly to choose an exit code, rather than
//! flattening them behind a boundary error type.

use std::collections::HashMap;

/// Errors raised while loading or validating the YAML config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid base_url {0:?}: must be an absolute http or https URL")]
    InvalidBaseUrl(String),
    #[error("refresh_interval must be >= 5s, got {0}s")]
    RefreshIntervalTooShort(u64),
    #[error("event.interval must be >= 1s, got {0}s")]
    EventIntervalTooShort(u64),
    #[error("event.max_events_per_tick must be >= 1, got {0}")]
    MaxEventsPerTickTooSmall(usize),
    #[error("event.rotation.order must have at least 2 phases")]
    RotationOrderTooShort,
    #[error("unknown rotation phase {0:?}")]
    UnknownRotationPhase(String),
    #[error("event.rotation.min_ag_hops ({min}) must be <= max_ag_hops ({max}), and min must be >= 1")]
    InvalidAgHopRange { min: u32, max: u32 },
    #[error("action {0:?} has non-positive weight")]
    NonPositiveActionWeight(String),
    #[error("unknown action type {0:?}")]
    UnknownActionType(String),
    #[error("devices list must not be empty")]
    NoDevices,
    #[error("device at index {0} is missing a device_id")]
    DeviceMissingId(usize),
    #[error("device {0:?} is missing an api_key")]
    DeviceMissingApiKey(String),
    #[error("device {device_id:?} default_session has a negative supervisor id")]
    NegativeSupervisorId { device_id: String },
    #[error("duplicate device_id {0:?}")]
    DuplicateDeviceId(String),
    #[error("required environment variable OGS_DEVICE_PIN is not set or empty")]
    MissingDevicePin,
}

/// Errors surfaced by the transport client. Every method either returns the
/// typed payload or one of these.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode response envelope from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{endpoint} reported an error: {message}")]
    Server { endpoint: String, message: String },
}

impl TransportError {
    /// `true` if the server's error message matches one of the "visit
    /// already closed" substrings the check-out recovery path looks for.
    ///
    /// This is a brittle coupling to the backend's literal error strings —
    /// preserved because the backend exposes no structured error codes.
    pub fn is_visit_already_closed(&self) -> bool {
        match self {
            TransportError::Server { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("visit not found")
                    || m.contains("no active visit")
                    || m.contains("room_id is required for check-in")
            }
            _ => false,
        }
    }

    /// `true` if the server's error message indicates the student already
    /// has a visit open (duplicate check-in).
    pub fn is_already_active_visit(&self) -> bool {
        match self {
            TransportError::Server { message, .. } => message
                .to_ascii_lowercase()
                .contains("student already has an active visit"),
            _ => false,
        }
    }
}

/// Errors raised by the event engine's action execution. The "no eligible
/// candidate" case isn't a variant here — it's `ExecutionOutcome::Skipped`,
/// since it's an expected per-tick outcome, not a failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Returned from bootstrap when one or more devices failed `Authenticate`.
/// Carries the per-device failure so the caller can decide whether to
/// continue serving the remaining devices or abort.
#[derive(Debug, thiserror::Error)]
#[error("partial authentication failure: {} of {} devices failed", failures.len(), attempted)]
pub struct ErrPartialAuthentication {
    pub attempted: usize,
    pub failures: HashMap<String, TransportError>,
}
