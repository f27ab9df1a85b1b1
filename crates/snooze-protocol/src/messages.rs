//! Typed bodies for the monitor ↔ agent RPC surface.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snooze_core::{InstanceState, ResourceSample, ResourceType, ScheduledAction};

/// Sent once at session start (and again after every reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub provider: String,
    pub thresholds: HashMap<ResourceType, f64>,
    #[serde(with = "humantime_serde")]
    pub nap_time: Duration,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub agent_id: String,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub instance_id: String,
}

/// Commands an agent can piggyback on a heartbeat response.
///
/// Executed by the monitor in the order received. Strings this build
/// does not recognize decode as `Unknown` and are reported through the
/// monitor's error handlers rather than silently dropped or allowed to
/// fail the whole heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MonitorCommand {
    Ping,
    Refresh,
    Stop,
    Unknown(String),
}

impl From<String> for MonitorCommand {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ping" => MonitorCommand::Ping,
            "refresh" => MonitorCommand::Refresh,
            "stop" => MonitorCommand::Stop,
            _ => MonitorCommand::Unknown(s),
        }
    }
}

impl From<MonitorCommand> for String {
    fn from(command: MonitorCommand) -> Self {
        match command {
            MonitorCommand::Ping => "ping".to_string(),
            MonitorCommand::Refresh => "refresh".to_string(),
            MonitorCommand::Stop => "stop".to_string(),
            MonitorCommand::Unknown(s) => s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: InstanceState,
    #[serde(default)]
    pub resource_usage: HashMap<ResourceType, ResourceSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    #[serde(default)]
    pub commands: Vec<MonitorCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleNotification {
    pub instance_id: String,
    pub idle_since: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub idle_duration: Duration,
    #[serde(default)]
    pub resource_usage: HashMap<ResourceType, ResourceSample>,
}

/// Agent verdict on an idle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    None,
    Wait,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleResponse {
    pub action: IdleAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_action: Option<ScheduledAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeReport {
    pub instance_id: String,
    pub previous_state: InstanceState,
    pub current_state: InstanceState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Generic `{success, error?}` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleAck {
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimpleAck {
    pub fn ok() -> Self {
        Self {
            acknowledged: true,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snooze_core::ResourceType;

    fn registration() -> InstanceRegistration {
        let mut thresholds = HashMap::new();
        thresholds.insert(ResourceType::Cpu, 10.0);
        thresholds.insert(ResourceType::UserInput, 0.0);

        InstanceRegistration {
            instance_id: "i-0abc".to_string(),
            instance_type: "t3.large".to_string(),
            region: "us-west-2".to_string(),
            zone: "us-west-2a".to_string(),
            provider: "aws".to_string(),
            thresholds,
            nap_time: Duration::from_secs(1800),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_registration_round_trip() {
        let reg = registration();
        let json = serde_json::to_string(&reg).unwrap();
        let back: InstanceRegistration = serde_json::from_str(&json).unwrap();

        assert_eq!(back.instance_id, "i-0abc");
        assert_eq!(back.thresholds.get(&ResourceType::Cpu), Some(&10.0));
        assert_eq!(back.nap_time, Duration::from_secs(1800));
    }

    #[test]
    fn test_nap_time_serializes_human_readable() {
        let json = serde_json::to_value(registration()).unwrap();
        assert_eq!(json["nap_time"], "30m");
    }

    #[test]
    fn test_commands_serialize_snake_case() {
        let json = serde_json::to_string(&vec![
            MonitorCommand::Refresh,
            MonitorCommand::Ping,
            MonitorCommand::Stop,
        ])
        .unwrap();
        assert_eq!(json, r#"["refresh","ping","stop"]"#);
    }

    #[test]
    fn test_unknown_command_is_captured_not_fatal() {
        let command: MonitorCommand = serde_json::from_str("\"self_destruct\"").unwrap();
        assert_eq!(command, MonitorCommand::Unknown("self_destruct".to_string()));
    }

    #[test]
    fn test_idle_response_omits_empty_fields() {
        let resp = IdleResponse {
            action: IdleAction::Wait,
            reason: None,
            scheduled_action: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"action":"wait"}"#);
    }
}
