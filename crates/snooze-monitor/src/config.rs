//! Monitor configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snooze_core::ResourceType;
use snooze_protocol::InstanceRegistration;

/// Identity of the instance this monitor runs on, as registered with the
/// agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub provider: String,
}

impl InstanceIdentity {
    /// Identity from the standard environment (`INSTANCE_ID` etc.), with
    /// placeholders for anything unset.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            instance_id: var("INSTANCE_ID", "unknown-instance"),
            instance_type: var("INSTANCE_TYPE", "unknown"),
            region: var("INSTANCE_REGION", "unknown"),
            zone: var("INSTANCE_ZONE", "unknown"),
            provider: var("INSTANCE_PROVIDER", "mock"),
        }
    }
}

/// Thresholds, timings and the agent endpoint. Built fluently before
/// [`crate::Monitor::start`]; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub instance: InstanceIdentity,
    /// Idle thresholds per resource kind; kinds without an entry are
    /// ignored by the evaluator.
    pub thresholds: HashMap<ResourceType, f64>,
    /// Minimum idle-epoch length before the agent is notified.
    #[serde(with = "humantime_serde")]
    pub nap_time: Duration,
    /// Sampling loop tick.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Agent `host:port`.
    pub agent_endpoint: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MonitorConfig {
    pub fn new(instance: InstanceIdentity) -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert(ResourceType::Cpu, 10.0);
        thresholds.insert(ResourceType::Memory, 30.0);
        thresholds.insert(ResourceType::Network, 5.0);
        thresholds.insert(ResourceType::Disk, 5.0);
        // Any input activity at all breaks idleness.
        thresholds.insert(ResourceType::UserInput, 0.0);

        Self {
            instance,
            thresholds,
            nap_time: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(30),
            agent_endpoint: std::env::var("SNOOZE_AGENT_ENDPOINT")
                .unwrap_or_else(|_| "127.0.0.1:7737".to_string()),
            metadata: HashMap::new(),
        }
    }

    /// Parse a TOML config file.
    pub fn from_toml(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn with_threshold(mut self, kind: ResourceType, value: f64) -> Self {
        self.thresholds.insert(kind, value);
        self
    }

    pub fn without_threshold(mut self, kind: &ResourceType) -> Self {
        self.thresholds.remove(kind);
        self
    }

    pub fn with_nap_time(mut self, nap_time: Duration) -> Self {
        self.nap_time = nap_time;
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn with_agent_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.agent_endpoint = endpoint.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The registration payload sent at session start.
    pub fn registration(&self) -> InstanceRegistration {
        InstanceRegistration {
            instance_id: self.instance.instance_id.clone(),
            instance_type: self.instance.instance_type.clone(),
            region: self.instance.region.clone(),
            zone: self.instance.zone.clone(),
            provider: self.instance.provider.clone(),
            thresholds: self.thresholds.clone(),
            nap_time: self.nap_time,
            metadata: self.metadata.clone(),
        }
    }
}
