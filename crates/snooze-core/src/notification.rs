//! Lifecycle notifications and the sink that consumes them.
//!
//! Delivery back-ends (Slack, e-mail, webhooks) live outside this
//! workspace; the agent only ever talks to the [`NotificationSink`] trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

/// A lifecycle event worth telling an operator about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Machine-readable event name, e.g. `instance_stopped`.
    pub kind: String,
    pub severity: NotificationSeverity,
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form event payload.
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Notification {
    pub fn new(
        kind: impl Into<String>,
        severity: NotificationSeverity,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            severity,
            instance_id: instance_id.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Consumer of notification records. Delivery is fire-and-forget: the
/// agent never fails an operation because a sink did.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default sink that forwards notifications to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, notification: Notification) {
        match notification.severity {
            NotificationSeverity::Info => tracing::info!(
                kind = %notification.kind,
                instance = %notification.instance_id,
                data = ?notification.data,
                "notification"
            ),
            NotificationSeverity::Warning => tracing::warn!(
                kind = %notification.kind,
                instance = %notification.instance_id,
                data = ?notification.data,
                "notification"
            ),
            NotificationSeverity::Error => tracing::error!(
                kind = %notification.kind,
                instance = %notification.instance_id,
                data = ?notification.data,
                "notification"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_builder() {
        let n = Notification::new("instance_stopped", NotificationSeverity::Info, "i-123")
            .with_data("provider", "aws")
            .with_data("reason", "idle");

        assert_eq!(n.kind, "instance_stopped");
        assert_eq!(n.instance_id, "i-123");
        assert_eq!(n.data.get("provider").map(String::as_str), Some("aws"));
        assert_eq!(n.data.len(), 2);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_all_severities() {
        let sink = TracingSink;
        for severity in [
            NotificationSeverity::Info,
            NotificationSeverity::Warning,
            NotificationSeverity::Error,
        ] {
            sink.notify(Notification::new("test", severity, "i-1")).await;
        }
    }
}
