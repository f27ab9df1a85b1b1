//! Error types for the monitor.

use snooze_core::ResourceType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("monitor is not running")]
    NotRunning,

    /// A probe failed to sample; the loop keeps the previous value and
    /// continues.
    #[error("probe '{kind}' failed: {source}")]
    Probe {
        kind: ResourceType,
        #[source]
        source: anyhow::Error,
    },

    #[error("agent session error: {0}")]
    Session(#[from] snooze_rpc::ClientError),

    #[error("agent rejected registration: {0}")]
    RegistrationRejected(String),

    #[error("agent sent unknown command '{0}'")]
    UnknownCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
