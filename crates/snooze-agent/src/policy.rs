//! Idle arbitration policy.
//!
//! The agent asks the policy what to do with each idle notification. The
//! default stops an instance the first time its idle duration crosses the
//! registered nap time; other deployments can plug in their own predicate
//! (business hours, cost windows, exclusion tags).

use snooze_core::ScheduledAction;
use snooze_protocol::{IdleAction, IdleNotification, IdleResponse};

use crate::registry::InstanceRecord;

pub trait IdlePolicy: Send + Sync {
    fn arbitrate(&self, record: &InstanceRecord, notification: &IdleNotification) -> IdleResponse;
}

/// Stop on the first idle notification at or past nap time; idempotent
/// for re-notifications within the same idle epoch.
#[derive(Debug, Default, Clone)]
pub struct DefaultIdlePolicy;

impl IdlePolicy for DefaultIdlePolicy {
    fn arbitrate(&self, record: &InstanceRecord, notification: &IdleNotification) -> IdleResponse {
        if record.stop_pending() {
            return IdleResponse {
                action: IdleAction::None,
                reason: Some("already scheduled".to_string()),
                scheduled_action: None,
            };
        }
        if matches!(
            record.state,
            snooze_core::InstanceState::Stopping | snooze_core::InstanceState::Stopped
        ) {
            return IdleResponse {
                action: IdleAction::None,
                reason: Some(format!("instance is {}", record.state)),
                scheduled_action: None,
            };
        }

        let nap_time = record.registration.nap_time;
        if notification.idle_duration < nap_time {
            return IdleResponse {
                action: IdleAction::Wait,
                reason: Some(format!(
                    "idle {:?} < nap time {:?}",
                    notification.idle_duration, nap_time
                )),
                scheduled_action: None,
            };
        }

        IdleResponse {
            action: IdleAction::Stop,
            reason: None,
            scheduled_action: Some(ScheduledAction::stop_now("idle ≥ nap_time")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snooze_core::ResourceType;
    use snooze_protocol::InstanceRegistration;
    use std::collections::HashMap;
    use std::time::Duration;

    fn record(nap_secs: u64) -> InstanceRecord {
        let registry = crate::registry::InstanceRegistry::new();
        registry.register(InstanceRegistration {
            instance_id: "i-1".to_string(),
            instance_type: "t3.large".to_string(),
            region: "us-west-2".to_string(),
            zone: "us-west-2a".to_string(),
            provider: "mock".to_string(),
            thresholds: HashMap::from([(ResourceType::Cpu, 10.0)]),
            nap_time: Duration::from_secs(nap_secs),
            metadata: HashMap::new(),
        });
        registry.get("i-1").unwrap()
    }

    fn notification(idle_secs: u64) -> IdleNotification {
        IdleNotification {
            instance_id: "i-1".to_string(),
            idle_since: chrono::Utc::now(),
            idle_duration: Duration::from_secs(idle_secs),
            resource_usage: HashMap::new(),
        }
    }

    #[test]
    fn test_below_nap_time_waits() {
        let response = DefaultIdlePolicy.arbitrate(&record(60), &notification(30));
        assert_eq!(response.action, IdleAction::Wait);
        assert!(response.scheduled_action.is_none());
    }

    #[test]
    fn test_at_nap_time_stops_with_scheduled_action() {
        let response = DefaultIdlePolicy.arbitrate(&record(60), &notification(60));
        assert_eq!(response.action, IdleAction::Stop);

        let action = response.scheduled_action.expect("scheduled action");
        assert_eq!(action.action, snooze_core::ActionKind::Stop);
        assert_eq!(action.reason, "idle ≥ nap_time");
    }

    #[test]
    fn test_renotification_with_stop_pending_is_none() {
        let mut rec = record(60);
        rec.stop_in_flight = true;

        let response = DefaultIdlePolicy.arbitrate(&rec, &notification(120));
        assert_eq!(response.action, IdleAction::None);
        assert_eq!(response.reason.as_deref(), Some("already scheduled"));
    }

    #[test]
    fn test_scheduled_stop_also_suppresses() {
        let mut rec = record(60);
        rec.scheduled_actions
            .push(snooze_core::ScheduledAction::stop_now("idle ≥ nap_time"));

        let response = DefaultIdlePolicy.arbitrate(&rec, &notification(120));
        assert_eq!(response.action, IdleAction::None);
    }
}
