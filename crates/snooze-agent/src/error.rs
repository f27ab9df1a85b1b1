//! Error types for the agent.

use snooze_core::InstanceState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Lookups for ids the registry has never seen are hard errors.
    #[error("instance '{0}' not found")]
    UnknownInstance(String),

    #[error("instance '{instance_id}' cannot transition {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("scheduled action index {index} out of range for instance '{instance_id}'")]
    NoSuchAction { instance_id: String, index: usize },

    #[error("plugin error: {0}")]
    Plugin(#[from] snooze_plugins::PluginError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
