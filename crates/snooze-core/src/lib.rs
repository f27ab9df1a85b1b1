//! Shared types for the snooze idle-resource reaper.
//!
//! Everything in this crate is plain data: resource samples produced by the
//! monitor's probes, instance lifecycle state tracked by the agent, and the
//! notification records both sides emit. The crates that do actual work
//! (`snooze-monitor`, `snooze-agent`, `snooze-plugins`) all depend on this
//! one and nothing here depends on them.

pub mod instance;
pub mod notification;
pub mod resource;

pub use instance::{ActionKind, InstanceInfo, InstanceState, ScheduledAction};
pub use notification::{Notification, NotificationSeverity, NotificationSink, TracingSink};
pub use resource::{ResourceSample, ResourceType};
