//! Validated configuration.
//!
//! Loads YAML with `${VAR}` / `$VAR` environment-variable expansion, applies
//! defaults, and rejects anything spec.md §4.1 calls invalid. The result is
//! an immutable value — nothing in this crate mutates a `Config` after load.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::state::rotation::RotationPhase;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_EVENT_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_EVENTS_PER_TICK: usize = 3;
const DEFAULT_MIN_AG_HOPS: u32 = 2;
const DEFAULT_MAX_AG_HOPS: u32 = 3;

/// Name of the required process environment variable carrying the shared
/// staff PIN sent on every transport call (`X-Staff-PIN`).
pub const DEVICE_PIN_ENV_VAR: &str = "OGS_DEVICE_PIN";

// ─── Raw YAML shape ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    base_url: Option<String>,
    refresh_interval: Option<String>,
    event: Option<RawEventConfig>,
    devices: Option<Vec<RawDevice>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEventConfig {
    interval: Option<String>,
    max_events_per_tick: Option<usize>,
    rotation: Option<RawRotationConfig>,
    actions: Option<Vec<RawActionConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRotationConfig {
    order: Option<Vec<String>>,
    min_ag_hops: Option<u32>,
    max_ag_hops: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawActionConfig {
    #[serde(rename = "type")]
    action_type: String,
    weight: f64,
    #[serde(default)]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    device_id: String,
    api_key: String,
    #[serde(default)]
    teacher_ids: Vec<i64>,
    default_session: Option<RawDefaultSession>,
}

#[derive(Debug, Deserialize)]
struct RawDefaultSession {
    activity_id: i64,
    room_id: i64,
    #[serde(default)]
    supervisor_ids: Vec<i64>,
}

// ─── Public, validated types ───────────────────────────────────────────────

/// Which kind of action the scheduler can pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    CheckIn,
    CheckOut,
    SchulhofHop,
    AttendanceToggle,
    SupervisorSwap,
}

impl ActionType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "checkin" => Some(Self::CheckIn),
            "checkout" => Some(Self::CheckOut),
            "schulhof_hop" => Some(Self::SchulhofHop),
            "attendance_toggle" => Some(Self::AttendanceToggle),
            "supervisor_swap" => Some(Self::SupervisorSwap),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::CheckIn => "checkin",
            Self::CheckOut => "checkout",
            Self::SchulhofHop => "schulhof_hop",
            Self::AttendanceToggle => "attendance_toggle",
            Self::SupervisorSwap => "supervisor_swap",
        }
    }
}

/// One weighted entry in `event.actions`. An empty `device_ids` allowlist
/// means "all devices".
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub action_type: ActionType,
    pub weight: f64,
    pub device_ids: Vec<String>,
}

impl ActionConfig {
    pub fn applies_to(&self, device_id: &str) -> bool {
        self.device_ids.is_empty() || self.device_ids.iter().any(|d| d == device_id)
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub order: Vec<RotationPhase>,
    pub min_ag_hops: u32,
    pub max_ag_hops: u32,
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    pub interval: Duration,
    pub max_events_per_tick: usize,
    pub rotation: RotationConfig,
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone)]
pub struct DefaultSession {
    pub activity_id: i64,
    pub room_id: i64,
    pub supervisor_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub api_key: String,
    pub teacher_ids: Vec<i64>,
    pub default_session: Option<DefaultSession>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub refresh_interval: Duration,
    pub event: EventConfig,
    pub devices: Vec<DeviceConfig>,
    /// Read from `OGS_DEVICE_PIN`; sent as `X-Staff-PIN` on every request.
    pub device_pin: String,
}

// ─── Loading ───────────────────────────────────────────────────────────────

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Expand `${VAR}` and `$VAR` references against the process environment.
/// References to unset variables are left untouched (not blanked) so a typo
/// surfaces as a YAML parse error rather than silently vanishing.
fn expand_env(raw: &str) -> String {
    VAR_PATTERN
        .replace_all(raw, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .expect("regex guarantees one of the two groups matched")
                .as_str();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Parse a duration string like `"30s"`, `"5m"`, `"1h"`, or a bare integer
/// (seconds). Matches the units the YAML examples in spec.md §6.1 use.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

fn default_rotation_order() -> Vec<RotationPhase> {
    use RotationPhase::*;
    vec![Heimatraum, Ag, Schulhof, Heimatraum]
}

fn default_actions() -> Vec<ActionConfig> {
    vec![
        ActionConfig { action_type: ActionType::CheckIn, weight: 1.0, device_ids: vec![] },
        ActionConfig { action_type: ActionType::CheckOut, weight: 0.8, device_ids: vec![] },
        ActionConfig { action_type: ActionType::SchulhofHop, weight: 0.4, device_ids: vec![] },
        ActionConfig { action_type: ActionType::AttendanceToggle, weight: 0.4, device_ids: vec![] },
        ActionConfig { action_type: ActionType::SupervisorSwap, weight: 0.3, device_ids: vec![] },
    ]
}

impl Config {
    /// Load and validate a config file from `path`, expanding environment
    /// variables in the raw text first.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate already-read YAML text. Split out from `load` so
    /// tests can exercise validation without touching the filesystem.
    pub fn parse(raw_text: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw_text);
        let raw: RawConfig = serde_yaml::from_str(&expanded)?;

        let device_pin = std::env::var(DEVICE_PIN_ENV_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingDevicePin)?;

        let base_url = raw.base_url.unwrap_or_default();
        validate_base_url(&base_url)?;

        let refresh_interval = raw
            .refresh_interval
            .and_then(|s| parse_duration(&s))
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS));
        if refresh_interval < Duration::from_secs(5) {
            return Err(ConfigError::RefreshIntervalTooShort(refresh_interval.as_secs()));
        }

        let raw_event = raw.event.unwrap_or_default();
        let event = build_event_config(raw_event)?;

        let devices = build_devices(raw.devices.unwrap_or_default())?;
        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        Ok(Config {
            base_url,
            refresh_interval,
            event,
            devices,
            device_pin,
        })
    }
}

fn validate_base_url(base_url: &str) -> Result<(), ConfigError> {
    let ok = base_url.starts_with("http://") || base_url.starts_with("https://");
    if !ok || reqwest::Url::parse(base_url).is_err() {
        return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
    }
    Ok(())
}

fn build_event_config(raw: RawEventConfig) -> Result<EventConfig, ConfigError> {
    let interval = raw
        .interval
        .and_then(|s| parse_duration(&s))
        .unwrap_or_else(|| Duration::from_secs(DEFAULT_EVENT_INTERVAL_SECS));
    if interval < Duration::from_secs(1) {
        return Err(ConfigError::EventIntervalTooShort(interval.as_secs()));
    }

    let max_events_per_tick = raw.max_events_per_tick.unwrap_or(DEFAULT_MAX_EVENTS_PER_TICK);
    if max_events_per_tick < 1 {
        return Err(ConfigError::MaxEventsPerTickTooSmall(max_events_per_tick));
    }

    let rotation = build_rotation_config(raw.rotation.unwrap_or_default())?;
    let actions = build_actions(raw.actions.unwrap_or_else(|| vec![]))?;

    Ok(EventConfig {
        interval,
        max_events_per_tick,
        rotation,
        actions: if actions.is_empty() { default_actions() } else { actions },
    })
}

fn build_rotation_config(raw: RawRotationConfig) -> Result<RotationConfig, ConfigError> {
    let order = match raw.order {
        Some(names) => {
            let mut phases = Vec::with_capacity(names.len());
            for name in names {
                phases.push(
                    RotationPhase::parse(&name).ok_or_else(|| ConfigError::UnknownRotationPhase(name.clone()))?,
                );
            }
            phases
        }
        None => default_rotation_order(),
    };
    if order.len() < 2 {
        return Err(ConfigError::RotationOrderTooShort);
    }

    let min_ag_hops = raw.min_ag_hops.unwrap_or(DEFAULT_MIN_AG_HOPS);
    let max_ag_hops = raw.max_ag_hops.unwrap_or(DEFAULT_MAX_AG_HOPS);
    if min_ag_hops < 1 || min_ag_hops > max_ag_hops {
        return Err(ConfigError::InvalidAgHopRange { min: min_ag_hops, max: max_ag_hops });
    }

    Ok(RotationConfig { order, min_ag_hops, max_ag_hops })
}

fn build_actions(raw: Vec<RawActionConfig>) -> Result<Vec<ActionConfig>, ConfigError> {
    let mut out = Vec::with_capacity(raw.len());
    for a in raw {
        let action_type =
            ActionType::parse(&a.action_type).ok_or_else(|| ConfigError::UnknownActionType(a.action_type.clone()))?;
        if a.weight <= 0.0 {
            return Err(ConfigError::NonPositiveActionWeight(a.action_type));
        }
        out.push(ActionConfig { action_type, weight: a.weight, device_ids: a.device_ids });
    }
    Ok(out)
}

fn build_devices(raw: Vec<RawDevice>) -> Result<Vec<DeviceConfig>, ConfigError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, d) in raw.into_iter().enumerate() {
        if d.device_id.is_empty() {
            return Err(ConfigError::DeviceMissingId(i));
        }
        if !seen.insert(d.device_id.clone()) {
            return Err(ConfigError::DuplicateDeviceId(d.device_id));
        }
        if d.api_key.is_empty() {
            return Err(ConfigError::DeviceMissingApiKey(d.device_id));
        }
        let default_session = match d.default_session {
            Some(s) => {
                if s.activity_id < 0 || s.room_id < 0 || s.supervisor_ids.iter().any(|id| *id < 0) {
                    return Err(ConfigError::NegativeSupervisorId { device_id: d.device_id.clone() });
                }
                Some(DefaultSession {
                    activity_id: s.activity_id,
                    room_id: s.room_id,
                    supervisor_ids: s.supervisor_ids,
                })
            }
            None => None,
        };
        out.push(DeviceConfig {
            device_id: d.device_id,
            api_key: d.api_key,
            teacher_ids: d.teacher_ids,
            default_session,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_pin<T>(f: impl FnOnce() -> T) -> T {
        std::env::set_var(DEVICE_PIN_ENV_VAR, "test-pin");
        let result = f();
        std::env::remove_var(DEVICE_PIN_ENV_VAR);
        result
    }

    #[test]
    fn loads_minimal_valid_config() {
        let yaml = r#"
base_url: http://backend.local:8080
devices:
  - device_id: dev-1
    api_key: key-1
"#;
        let cfg = with_pin(|| Config::parse(yaml)).expect("should parse");
        assert_eq!(cfg.base_url, "http://backend.local:8080");
        assert_eq!(cfg.refresh_interval, Duration::from_secs(60));
        assert_eq!(cfg.event.interval, Duration::from_secs(5));
        assert_eq!(cfg.event.max_events_per_tick, 3);
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.event.rotation.min_ag_hops, 2);
        assert_eq!(cfg.event.rotation.max_ag_hops, 3);
    }

    #[test]
    fn rejects_missing_pin() {
        let yaml = r#"
base_url: http://backend.local
devices:
  - device_id: dev-1
    api_key: key-1
"#;
        std::env::remove_var(DEVICE_PIN_ENV_VAR);
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDevicePin));
    }

    #[test]
    fn rejects_bad_scheme() {
        let yaml = r#"
base_url: ftp://backend.local
devices:
  - device_id: dev-1
    api_key: key-1
"#;
        let err = with_pin(|| Config::parse(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl(_)));
    }

    #[test]
    fn rejects_empty_device_list() {
        let yaml = r#"
base_url: http://backend.local
devices: []
"#;
        let err = with_pin(|| Config::parse(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::NoDevices));
    }

    #[test]
    fn rejects_short_refresh_interval() {
        let yaml = r#"
base_url: http://backend.local
refresh_interval: 2s
devices:
  - device_id: dev-1
    api_key: key-1
"#;
        let err = with_pin(|| Config::parse(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::RefreshIntervalTooShort(2)));
    }

    #[test]
    fn rejects_bad_ag_hop_range() {
        let yaml = r#"
base_url: http://backend.local
event:
  rotation:
    min_ag_hops: 4
    max_ag_hops: 2
devices:
  - device_id: dev-1
    api_key: key-1
"#;
        let err = with_pin(|| Config::parse(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAgHopRange { .. }));
    }

    #[test]
    fn expands_env_vars() {
        std::env::set_var("SIM_TEST_HOST", "http://expanded.example:9000");
        let yaml = "base_url: ${SIM_TEST_HOST}\ndevices:\n  - device_id: d\n    api_key: k\n";
        let cfg = with_pin(|| Config::parse(yaml)).expect("should parse");
        assert_eq!(cfg.base_url, "http://expanded.example:9000");
        std::env::remove_var("SIM_TEST_HOST");
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let yaml = r#"
base_url: http://backend.local
devices:
  - device_id: dup
    api_key: k1
  - device_id: dup
    api_key: k2
"#;
        let err = with_pin(|| Config::parse(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDeviceId(_)));
    }

    #[test]
    fn load_reads_and_parses_a_file_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("simulator.yaml");
        std::fs::write(
            &path,
            r#"
base_url: http://backend.local:8080
devices:
  - device_id: dev-1
    api_key: key-1
"#,
        )
        .expect("write config");

        let cfg = with_pin(|| Config::load(&path)).expect("should load");
        assert_eq!(cfg.base_url, "http://backend.local:8080");
        assert_eq!(cfg.devices.len(), 1);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("does-not-exist.yaml");
        let err = with_pin(|| Config::load(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
