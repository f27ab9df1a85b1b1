//! Monitor state: one writer (the sampling loop), many readers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use snooze_core::{ResourceSample, ResourceType};
use snooze_protocol::IdleAction;

/// Snapshot of the monitor's current view of the host.
///
/// Invariants: `is_idle ⇔ idle_since.is_some()`, and while idle
/// `idle_duration` is the age of `idle_since`.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    pub is_idle: bool,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_duration: Duration,
    pub current_usage: HashMap<ResourceType, ResourceSample>,
    pub connected_to_agent: bool,
    /// Verdict from the most recent idle notification, if any.
    pub last_verdict: Option<IdleAction>,
}

/// Shared cell around [`MonitorState`]. The sampling loop is the sole
/// mutator of the idle fields; the session task only touches
/// connectivity and the verdict.
#[derive(Default)]
pub struct StateCell {
    inner: RwLock<MonitorState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MonitorState {
        self.inner.read().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.read().is_idle
    }

    pub fn idle_duration(&self) -> Duration {
        self.inner.read().idle_duration
    }

    pub fn update_usage(&self, sample: ResourceSample) {
        self.inner
            .write()
            .current_usage
            .insert(sample.kind.clone(), sample);
    }

    pub fn usage(&self) -> HashMap<ResourceType, ResourceSample> {
        self.inner.read().current_usage.clone()
    }

    /// active → idle transition.
    pub fn enter_idle(&self, now: DateTime<Utc>) {
        let mut state = self.inner.write();
        state.is_idle = true;
        state.idle_since = Some(now);
        state.idle_duration = Duration::ZERO;
    }

    /// idle → active transition.
    pub fn exit_idle(&self) {
        let mut state = self.inner.write();
        state.is_idle = false;
        state.idle_since = None;
        state.idle_duration = Duration::ZERO;
        state.last_verdict = None;
    }

    /// idle → idle tick: recompute the duration from `idle_since`.
    /// Returns the fresh duration.
    pub fn refresh_idle_duration(&self, now: DateTime<Utc>) -> Duration {
        let mut state = self.inner.write();
        let duration = state
            .idle_since
            .map(|since| (now - since).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        state.idle_duration = duration;
        duration
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.inner.read().idle_since
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.write().connected_to_agent = connected;
    }

    pub fn set_last_verdict(&self, verdict: IdleAction) {
        self.inner.write().last_verdict = Some(verdict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_invariant_holds_through_transitions() {
        let cell = StateCell::new();

        let state = cell.snapshot();
        assert!(!state.is_idle && state.idle_since.is_none());

        cell.enter_idle(Utc::now());
        let state = cell.snapshot();
        assert!(state.is_idle && state.idle_since.is_some());
        assert_eq!(state.idle_duration, Duration::ZERO);

        cell.exit_idle();
        let state = cell.snapshot();
        assert!(!state.is_idle && state.idle_since.is_none());
        assert_eq!(state.idle_duration, Duration::ZERO);
    }

    #[test]
    fn test_refresh_idle_duration_tracks_wall_clock() {
        let cell = StateCell::new();
        let start = Utc::now() - chrono::Duration::seconds(90);
        cell.enter_idle(start);

        let duration = cell.refresh_idle_duration(Utc::now());
        assert!(duration >= Duration::from_secs(89), "got {:?}", duration);
        assert_eq!(cell.snapshot().idle_duration, duration);
    }

    #[test]
    fn test_usage_keeps_latest_per_kind() {
        let cell = StateCell::new();
        cell.update_usage(ResourceSample::new(ResourceType::Cpu, 10.0));
        cell.update_usage(ResourceSample::new(ResourceType::Cpu, 60.0));
        cell.update_usage(ResourceSample::new(ResourceType::Memory, 20.0));

        let usage = cell.usage();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[&ResourceType::Cpu].value, 60.0);
    }

    #[test]
    fn test_exit_idle_clears_verdict() {
        let cell = StateCell::new();
        cell.enter_idle(Utc::now());
        cell.set_last_verdict(IdleAction::Stop);
        assert!(cell.snapshot().last_verdict.is_some());

        cell.exit_idle();
        assert!(cell.snapshot().last_verdict.is_none());
    }
}
