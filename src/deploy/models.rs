use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Canonical events ──────────────────────────────────────────────────

/// Client-visible payload of a canonical event. Serialized with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Progress {
        info: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_step: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_steps: Option<u32>,
    },
    Instruction {
        name: String,
        instruction: String,
        arguments: serde_json::Value,
    },
    Result {
        info: String,
    },
    Log {
        info: String,
    },
    Error {
        info: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Instruction { .. } => "instruction",
            Self::Result { .. } => "result",
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
        }
    }

    /// Error marker in the `Error: <message>` form observers already parse.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error {
            info: format!("Error: {}", message),
        }
    }
}

/// One entry of a session's append log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(seq: u64, payload: EventPayload) -> Self {
        Self {
            seq,
            at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ── Native job-runner events ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstructionArg {
    #[serde(default)]
    pub name: Option<String>,
    pub serialized_value: String,
    #[serde(default)]
    pub is_representative: bool,
}

/// Event variants emitted by the workload runner while a job executes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NativeEvent {
    Progress {
        #[serde(default)]
        step_info: Vec<String>,
        #[serde(default)]
        current_step: u32,
        #[serde(default)]
        total_steps: u32,
    },
    Instruction {
        name: String,
        executable: String,
        #[serde(default)]
        arguments: Vec<InstructionArg>,
    },
    InstructionResult {
        serialized_result: String,
    },
    Info {
        message: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
    RunFinished {
        success: bool,
        #[serde(default)]
        output: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

// ── Deployment lifecycle ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeploymentStatus {
    Pending,
    Operational,
    Error,
    Terminated,
    SubscriptionPending,
    SubscriptionOperational,
    SubscriptionError,
    SubscriptionTerminated,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Operational => "Operational",
            Self::Error => "Error",
            Self::Terminated => "Terminated",
            Self::SubscriptionPending => "SubscriptionPending",
            Self::SubscriptionOperational => "SubscriptionOperational",
            Self::SubscriptionError => "SubscriptionError",
            Self::SubscriptionTerminated => "SubscriptionTerminated",
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionPending
                | Self::SubscriptionOperational
                | Self::SubscriptionError
                | Self::SubscriptionTerminated
        )
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated | Self::SubscriptionTerminated)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::SubscriptionError)
    }

    pub fn initial(subscription: bool) -> Self {
        if subscription {
            Self::SubscriptionPending
        } else {
            Self::Pending
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Operational" => Ok(Self::Operational),
            "Error" => Ok(Self::Error),
            "Terminated" => Ok(Self::Terminated),
            "SubscriptionPending" => Ok(Self::SubscriptionPending),
            "SubscriptionOperational" => Ok(Self::SubscriptionOperational),
            "SubscriptionError" => Ok(Self::SubscriptionError),
            "SubscriptionTerminated" => Ok(Self::SubscriptionTerminated),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub name: String,
    pub status: DeploymentStatus,
    pub deletion_date: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(name: &str, status: DeploymentStatus) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            status,
            deletion_date: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Run requests ──────────────────────────────────────────────────────

/// What to execute inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub package_url: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub deployment: String,
    pub session_id: Option<String>,
    pub job: JobSpec,
    pub subscription: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTicket {
    pub session_id: String,
    pub deployment: String,
}

// ── Service logs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub line: String,
}

// ── Sandbox services ──────────────────────────────────────────────────

/// A service started by a job, as reported by the runner. Ports map a port
/// id to its number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub uuid: String,
    pub private_ip: String,
    #[serde(default)]
    pub private_ports: BTreeMap<String, u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub public_ports: BTreeMap<String, u16>,
}

/// Outcome of a command run inside a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_wire_shape() {
        let event = Event::new(
            0,
            EventPayload::Progress {
                info: "Adding service el-1".to_string(),
                current_step: Some(1),
                total_steps: Some(4),
            },
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 0);
        assert_eq!(json["type"], "progress");
        assert_eq!(json["info"], "Adding service el-1");
        assert_eq!(json["current_step"], 1);
        assert_eq!(json["total_steps"], 4);
        assert!(json["at"].is_string());
    }

    #[test]
    fn test_progress_without_steps_omits_fields() {
        let payload = EventPayload::Progress {
            info: "Network run successfully".to_string(),
            current_step: None,
            total_steps: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("current_step"));
        assert!(json.contains("\"type\":\"progress\""));
    }

    #[test]
    fn test_event_roundtrip_through_json() {
        let event = Event::new(
            7,
            EventPayload::Instruction {
                name: "add_service".to_string(),
                instruction: "add_service(name=\"db\")".to_string(),
                arguments: serde_json::json!([{"name": "name", "value": "db"}]),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "instruction");
    }

    #[test]
    fn test_error_marker_prefix() {
        let payload = EventPayload::error("boom");
        assert_eq!(
            payload,
            EventPayload::Error {
                info: "Error: boom".to_string()
            }
        );
    }

    #[test]
    fn test_native_event_parses_tagged_json() {
        let line = r#"{"kind":"progress","step_info":["Uploading"],"current_step":2,"total_steps":5}"#;
        let event: NativeEvent = serde_json::from_str(line).unwrap();
        assert_eq!(
            event,
            NativeEvent::Progress {
                step_info: vec!["Uploading".to_string()],
                current_step: 2,
                total_steps: 5,
            }
        );
    }

    #[test]
    fn test_native_event_unknown_kind() {
        let event: NativeEvent = serde_json::from_str(r#"{"kind":"telemetry"}"#).unwrap();
        assert_eq!(event, NativeEvent::Unknown);
    }

    #[test]
    fn test_status_track_predicates() {
        assert!(DeploymentStatus::SubscriptionError.is_subscription());
        assert!(DeploymentStatus::SubscriptionError.is_error());
        assert!(!DeploymentStatus::Operational.is_subscription());
        assert!(DeploymentStatus::Terminated.is_terminated());
        assert!(DeploymentStatus::SubscriptionTerminated.is_terminated());
        assert!(!DeploymentStatus::Error.is_terminated());
        assert_eq!(DeploymentStatus::initial(true), DeploymentStatus::SubscriptionPending);
        assert_eq!(DeploymentStatus::initial(false), DeploymentStatus::Pending);
    }

    #[test]
    fn test_status_from_str_roundtrip() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Operational,
            DeploymentStatus::Error,
            DeploymentStatus::Terminated,
            DeploymentStatus::SubscriptionPending,
            DeploymentStatus::SubscriptionOperational,
            DeploymentStatus::SubscriptionError,
            DeploymentStatus::SubscriptionTerminated,
        ] {
            assert_eq!(DeploymentStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(DeploymentStatus::from_str("Running").is_err());
    }

    #[test]
    fn test_job_spec_defaults_params() {
        let job: JobSpec =
            serde_json::from_str(r#"{"package_url":"github.com/org/pkg"}"#).unwrap();
        assert_eq!(job.params, serde_json::json!({}));
    }
}
