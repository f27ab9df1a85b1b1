//! Executes scheduled provider actions through the plugin runtime.
//!
//! A stop moves the record to `stopping`, calls the provider plugin and
//! moves it to `stopped` on acknowledgement. Failures retry with
//! exponential backoff; after the retry budget is spent the record stays
//! in `stopping` for operator intervention and an error notification is
//! emitted. Timeouts surface as in-progress, never as failure.

use std::sync::Arc;
use std::time::Duration;

use snooze_core::{
    InstanceState, Notification, NotificationSeverity, NotificationSink,
};
use snooze_plugins::{OperationOutcome, PluginRuntime};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::registry::InstanceRegistry;

#[derive(Clone)]
pub struct ActionDispatcher {
    registry: Arc<InstanceRegistry>,
    runtime: Arc<PluginRuntime>,
    sink: Arc<dyn NotificationSink>,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        runtime: Arc<PluginRuntime>,
        sink: Arc<dyn NotificationSink>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            sink,
            retry_attempts: config.stop_retry_attempts.max(1),
            retry_base_delay: config.stop_retry_base_delay,
        }
    }

    /// Fire-and-forget execution of a scheduled stop. The caller must
    /// have won the `stop_in_flight` flag first.
    pub fn spawn_stop(&self, instance_id: String) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.execute_stop(&instance_id).await;
        });
    }

    async fn execute_stop(&self, instance_id: &str) {
        let record = match self.registry.get(instance_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(instance = instance_id, error = %e, "stop target vanished");
                return;
            }
        };
        let provider = record.registration.provider.clone();

        if let Err(e) = self.registry.update_state(instance_id, InstanceState::Stopping) {
            warn!(instance = instance_id, error = %e, "cannot enter stopping");
            let _ = self.registry.set_stop_in_flight(instance_id, false);
            return;
        }

        let mut delay = self.retry_base_delay;
        let mut last_error = String::new();

        for attempt in 1..=self.retry_attempts {
            match self.try_stop(&provider).await {
                Ok(OperationOutcome::Completed { success: true, .. }) => {
                    self.finish_stop(instance_id, &provider).await;
                    return;
                }
                Ok(OperationOutcome::InProgress) => {
                    // Provider is still working; the record remains in
                    // `stopping` and a later reconciliation observes the
                    // final state. Not a failure.
                    info!(instance = instance_id, "stop still in progress at deadline");
                    self.remove_stop_action(instance_id);
                    let _ = self.registry.set_stop_in_flight(instance_id, false);
                    self.notify(
                        instance_id,
                        "instance_stop_in_progress",
                        NotificationSeverity::Info,
                        &provider,
                        None,
                    )
                    .await;
                    return;
                }
                Ok(OperationOutcome::Completed {
                    success: false,
                    error_message,
                }) => {
                    last_error =
                        error_message.unwrap_or_else(|| "provider reported failure".to_string());
                }
                Err(e) => last_error = e.to_string(),
            }

            warn!(
                instance = instance_id,
                attempt,
                max = self.retry_attempts,
                error = %last_error,
                "stop attempt failed"
            );
            if attempt < self.retry_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        // Budget exhausted: leave `stopping` for an operator, flag down so
        // a fresh idle epoch can try again later.
        error!(instance = instance_id, error = %last_error, "stop failed after retries");
        self.remove_stop_action(instance_id);
        let _ = self.registry.set_stop_in_flight(instance_id, false);
        self.notify(
            instance_id,
            "instance_stop_failed",
            NotificationSeverity::Error,
            &provider,
            Some(last_error),
        )
        .await;
    }

    async fn try_stop(&self, provider: &str) -> snooze_plugins::Result<OperationOutcome> {
        let handle = self.runtime.load(provider).await?;
        handle.stop_instance().await
    }

    async fn finish_stop(&self, instance_id: &str, provider: &str) {
        if let Err(e) = self.registry.update_state(instance_id, InstanceState::Stopped) {
            warn!(instance = instance_id, error = %e, "cannot enter stopped");
        }
        self.remove_stop_action(instance_id);
        let _ = self.registry.set_stop_in_flight(instance_id, false);

        info!(instance = instance_id, provider, "instance stopped");
        self.notify(
            instance_id,
            "instance_stopped",
            NotificationSeverity::Info,
            provider,
            None,
        )
        .await;
    }

    /// Drop the (concluded) stop entry from the record's schedule.
    fn remove_stop_action(&self, instance_id: &str) {
        if let Ok(record) = self.registry.get(instance_id) {
            if let Some(index) = record
                .scheduled_actions
                .iter()
                .position(|a| a.action == snooze_core::ActionKind::Stop)
            {
                let _ = self.registry.remove_scheduled_action(instance_id, index);
            }
        }
    }

    /// Start an instance through its provider plugin (operator-driven or
    /// scheduled start).
    pub async fn execute_start(&self, instance_id: &str) -> crate::error::Result<()> {
        let record = self.registry.get(instance_id)?;
        let handle = self.runtime.load(&record.registration.provider).await?;

        match handle.start_instance().await? {
            OperationOutcome::Completed { success: true, .. } => {
                self.registry
                    .update_state(instance_id, InstanceState::Running)?;
                self.notify(
                    instance_id,
                    "instance_started",
                    NotificationSeverity::Info,
                    &record.registration.provider,
                    None,
                )
                .await;
                Ok(())
            }
            OperationOutcome::InProgress => Ok(()),
            OperationOutcome::Completed {
                success: false,
                error_message,
            } => {
                let reason = error_message.unwrap_or_else(|| "provider reported failure".to_string());
                self.notify(
                    instance_id,
                    "instance_start_failed",
                    NotificationSeverity::Error,
                    &record.registration.provider,
                    Some(reason.clone()),
                )
                .await;
                Err(crate::error::AgentError::Plugin(
                    snooze_plugins::PluginError::Communication {
                        name: record.registration.provider.clone(),
                        reason,
                    },
                ))
            }
        }
    }

    async fn notify(
        &self,
        instance_id: &str,
        kind: &str,
        severity: NotificationSeverity,
        provider: &str,
        error: Option<String>,
    ) {
        let mut notification =
            Notification::new(kind, severity, instance_id).with_data("provider", provider);
        if let Some(error) = error {
            notification = notification.with_data("error", error);
        }
        self.sink.notify(notification).await;
    }
}
