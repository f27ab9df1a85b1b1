//! Host-side resource monitor.
//!
//! Samples local resource utilization through pluggable probes, runs the
//! idle state machine, and keeps a long-lived session to the agent. Two
//! cooperative tasks do all the work: the sampling loop (probe → evaluate
//! → transition) and the agent session (register → heartbeat → execute
//! commands), connected only by channels, so the session never touches the
//! monitor object itself.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod monitor;
pub mod probes;
pub mod session;
pub mod state;

pub use config::{InstanceIdentity, MonitorConfig};
pub use error::{MonitorError, Result};
pub use monitor::Monitor;
pub use probes::{FnProbe, Probe};
pub use state::MonitorState;
