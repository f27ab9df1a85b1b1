//! Resource kinds and the samples probes produce for them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of resource a probe measures.
///
/// The built-in kinds map to OS-level measurements; `Custom` carries the
/// name of a probe registered at runtime and is a first-class kind
/// everywhere (thresholds, usage maps, wire messages).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cpu,
    Memory,
    Network,
    Disk,
    UserInput,
    Gpu,
    Custom(String),
}

impl ResourceType {
    /// All built-in kinds, in probe-registration order.
    pub const BUILTIN: [ResourceType; 6] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Network,
        ResourceType::Disk,
        ResourceType::UserInput,
        ResourceType::Gpu,
    ];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::Disk => write!(f, "disk"),
            ResourceType::UserInput => write!(f, "user_input"),
            ResourceType::Gpu => write!(f, "gpu"),
            ResourceType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(ResourceType::Cpu),
            "memory" => Ok(ResourceType::Memory),
            "network" => Ok(ResourceType::Network),
            "disk" => Ok(ResourceType::Disk),
            "user_input" => Ok(ResourceType::UserInput),
            "gpu" => Ok(ResourceType::Gpu),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(ResourceType::Custom(name.to_string())),
                _ => Err(format!("unknown resource type: {}", other)),
            },
        }
    }
}

impl Serialize for ResourceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One measurement from a probe.
///
/// `value` is a utilization percentage in `[0, 100]`. Samples are
/// immutable; the monitor keeps only the latest one per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub kind: ResourceType,
    pub value: f64,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    /// Create a sample taken now, clamping the value into `[0, 100]`.
    pub fn new(kind: ResourceType, value: f64) -> Self {
        Self {
            kind,
            value: value.clamp(0.0, 100.0),
            taken_at: Utc::now(),
        }
    }

    /// Create a sample with an explicit timestamp.
    pub fn at(kind: ResourceType, value: f64, taken_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            value: value.clamp(0.0, 100.0),
            taken_at,
        }
    }
}
