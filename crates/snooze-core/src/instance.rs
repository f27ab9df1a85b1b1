//! Instance lifecycle state and provider-facing instance descriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed instance as tracked by the agent.
///
/// The legal walk is `running → idle → stopping → stopped → running`,
/// with `running ↔ idle` driven by the monitor and the rest by the agent
/// and its provider plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Idle,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (s, n) if s == n => true,
            (Running, Idle) | (Idle, Running) => true,
            // `running → stopping` happens when a heartbeat flips an
            // idle record back to running after a stop was already
            // scheduled; the dispatch still proceeds.
            (Idle, Stopping) | (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Running) => true,
            // A stale monitor re-registering as running while a stop is
            // mid-flight is resolved in the registry, not here.
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Running => "running",
            InstanceState::Idle => "idle",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Description of a cloud instance as reported by a provider plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub provider: String,
    pub state: InstanceState,
}

/// What an agent decided to do to an instance, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Stop,
    Start,
}

/// A stop/start queued against an instance record.
///
/// Removed from the record when executed or cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub action: ActionKind,
    pub scheduled_time: DateTime<Utc>,
    pub reason: String,
}

impl ScheduledAction {
    pub fn stop_now(reason: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Stop,
            scheduled_time: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn start_at(scheduled_time: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Start,
            scheduled_time,
            reason: reason.into(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_walk_is_legal() {
        use InstanceState::*;
        assert!(Running.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Running));
        assert!(Idle.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
    }

    #[test]
    fn test_running_may_enter_stopping_directly() {
        // A scheduled stop can fire after a heartbeat already pulled the
        // record back from idle to running.
        assert!(InstanceState::Running.can_transition_to(InstanceState::Stopping));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use InstanceState::*;
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Idle));
        assert!(!Stopping.can_transition_to(Idle));
        assert!(!Stopped.can_transition_to(Stopping));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&InstanceState::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
