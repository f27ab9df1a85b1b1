//! In-memory instance registry.
//!
//! One reader–writer lock guards the whole table; every mutation for a
//! given `instance_id` happens under the write lock, which is what makes
//! per-instance operation sequences linearizable. Command queues are
//! per-record FIFOs drained atomically by the heartbeat that picks them
//! up.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use snooze_core::{InstanceState, ResourceSample, ResourceType, ScheduledAction};
use snooze_protocol::{InstanceRegistration, MonitorCommand};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Everything the agent knows about one instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub registration: InstanceRegistration,
    pub state: InstanceState,
    /// False once heartbeats go stale; does not affect `state` beyond
    /// the idle rollback in [`InstanceRegistry::mark_stale`].
    pub connected: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_duration: Duration,
    pub latest_usage: HashMap<ResourceType, ResourceSample>,
    pub scheduled_actions: Vec<ScheduledAction>,
    /// A stop has been handed to the dispatcher and has not concluded.
    pub stop_in_flight: bool,
    pending_commands: VecDeque<MonitorCommand>,
}

impl InstanceRecord {
    fn new(registration: InstanceRegistration) -> Self {
        let now = Utc::now();
        Self {
            registration,
            state: InstanceState::Running,
            connected: true,
            registered_at: now,
            last_heartbeat: now,
            idle_since: None,
            idle_duration: Duration::ZERO,
            latest_usage: HashMap::new(),
            scheduled_actions: Vec::new(),
            stop_in_flight: false,
            pending_commands: VecDeque::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.registration.instance_id
    }

    /// True when a stop is queued or already executing.
    pub fn stop_pending(&self) -> bool {
        self.stop_in_flight
            || self
                .scheduled_actions
                .iter()
                .any(|a| a.action == snooze_core::ActionKind::Stop)
    }
}

/// The agent's table of managed instances.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: RwLock<HashMap<String, InstanceRecord>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Re-registration replaces the record: a
    /// monitor that reconnects (or restarts) starts from a clean slate,
    /// indistinguishable from a fresh registration.
    pub fn register(&self, registration: InstanceRegistration) {
        let id = registration.instance_id.clone();
        let record = InstanceRecord::new(registration);
        let replaced = self.inner.write().insert(id.clone(), record).is_some();
        if replaced {
            info!(instance = %id, "instance re-registered");
        } else {
            info!(instance = %id, "instance registered");
        }
    }

    pub fn unregister(&self, instance_id: &str) -> Result<()> {
        self.inner
            .write()
            .remove(instance_id)
            .map(|_| info!(instance = instance_id, "instance unregistered"))
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))
    }

    pub fn get(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.inner
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.inner.read().contains_key(instance_id)
    }

    pub fn get_all(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.inner.read().values().cloned().collect();
        records.sort_by(|a, b| a.registration.instance_id.cmp(&b.registration.instance_id));
        records
    }

    pub fn get_by_state(&self, state: InstanceState) -> Vec<InstanceRecord> {
        self.inner
            .read()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    /// Transition an instance's state, enforcing the lifecycle walk.
    pub fn update_state(&self, instance_id: &str, next: InstanceState) -> Result<InstanceState> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;

        let previous = record.state;
        if !previous.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: previous,
                to: next,
            });
        }

        record.state = next;
        match next {
            InstanceState::Idle => {
                if record.idle_since.is_none() {
                    record.idle_since = Some(Utc::now());
                }
            }
            InstanceState::Running | InstanceState::Stopped => {
                record.idle_since = None;
                record.idle_duration = Duration::ZERO;
            }
            InstanceState::Stopping => {}
        }

        debug!(instance = instance_id, from = %previous, to = %next, "state updated");
        Ok(previous)
    }

    /// Apply one heartbeat: freshness, state, usage; drain and return the
    /// pending command queue (FIFO).
    pub fn touch_heartbeat(
        &self,
        instance_id: &str,
        state: InstanceState,
        usage: HashMap<ResourceType, ResourceSample>,
    ) -> Result<Vec<MonitorCommand>> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;

        record.last_heartbeat = Utc::now();
        record.connected = true;
        record.latest_usage = usage;

        if record.state != state && record.state.can_transition_to(state) {
            record.state = state;
        }
        if record.state == InstanceState::Idle && record.idle_since.is_none() {
            record.idle_since = Some(Utc::now());
        }
        if record.state == InstanceState::Running {
            record.idle_since = None;
            record.idle_duration = Duration::ZERO;
        }

        Ok(record.pending_commands.drain(..).collect())
    }

    /// Record idle bookkeeping reported by the monitor.
    pub fn update_idle(
        &self,
        instance_id: &str,
        idle_since: DateTime<Utc>,
        idle_duration: Duration,
        usage: HashMap<ResourceType, ResourceSample>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;

        if record.state == InstanceState::Running {
            record.state = InstanceState::Idle;
        }
        record.idle_since = Some(idle_since);
        record.idle_duration = idle_duration;
        if !usage.is_empty() {
            record.latest_usage = usage;
        }
        Ok(())
    }

    /// Queue a command for delivery on the instance's next heartbeat.
    pub fn queue_command(&self, instance_id: &str, command: MonitorCommand) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;
        record.pending_commands.push_back(command);
        Ok(())
    }

    pub fn add_scheduled_action(&self, instance_id: &str, action: ScheduledAction) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;
        record.scheduled_actions.push(action);
        Ok(())
    }

    pub fn remove_scheduled_action(&self, instance_id: &str, index: usize) -> Result<ScheduledAction> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;
        if index >= record.scheduled_actions.len() {
            return Err(AgentError::NoSuchAction {
                instance_id: instance_id.to_string(),
                index,
            });
        }
        Ok(record.scheduled_actions.remove(index))
    }

    /// Flip the stop-in-flight flag; returns the previous value so the
    /// caller can detect a lost race.
    pub fn set_stop_in_flight(&self, instance_id: &str, in_flight: bool) -> Result<bool> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;
        Ok(std::mem::replace(&mut record.stop_in_flight, in_flight))
    }

    /// Mark records silent for longer than `stale_after` as disconnected.
    /// Idle records roll back to running (we no longer trust the idle
    /// report); no automatic stop is ever issued from here.
    pub fn mark_stale(&self, stale_after: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut flagged = Vec::new();
        let mut inner = self.inner.write();
        for (id, record) in inner.iter_mut() {
            if record.connected && record.last_heartbeat < cutoff {
                record.connected = false;
                if record.state == InstanceState::Idle {
                    record.state = InstanceState::Running;
                    record.idle_since = None;
                    record.idle_duration = Duration::ZERO;
                }
                warn!(instance = %id, "no heartbeat within stale window, marking disconnected");
                flagged.push(id.clone());
            }
        }
        flagged
    }
}
