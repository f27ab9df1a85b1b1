//! Error type for the plugin runtime.

use snooze_security::{ErrorCode, SecurityError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginError>;

#[derive(Debug, Error)]
pub enum PluginError {
    /// Security gate failures (signature, auth, TLS) surface verbatim so
    /// callers see the original stable code.
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{name}' handshake failed: {reason}")]
    Handshake { name: String, reason: String },

    #[error("plugin '{name}' communication failed: {reason}")]
    Communication { name: String, reason: String },

    /// A call exceeded its deadline. Stop/start callers convert this to
    /// an "operation in progress" outcome instead of failing.
    #[error("plugin '{name}' call '{method}' timed out")]
    Timeout { name: String, method: String },

    #[error("plugin '{name}' API version {plugin_version} incompatible with host {host_version}")]
    VersionIncompatible {
        name: String,
        plugin_version: String,
        host_version: String,
    },

    #[error("plugin '{name}' returned RPC error {code}: {message}")]
    Rpc {
        name: String,
        code: i64,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// The stable error code for this failure, when one applies.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            PluginError::Security(e) => Some(e.code),
            PluginError::NotFound(_) => Some(ErrorCode::PluginNotFound),
            PluginError::Handshake { .. } => Some(ErrorCode::PluginInvalid),
            PluginError::Communication { .. }
            | PluginError::Timeout { .. }
            | PluginError::Rpc { .. } => Some(ErrorCode::PluginCommunicationFailed),
            PluginError::VersionIncompatible { .. } => None,
            PluginError::Io(_) | PluginError::Serialization(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_codes_pass_through() {
        let err: PluginError = SecurityError::new(ErrorCode::SigHashMismatch).into();
        assert_eq!(err.code(), Some(ErrorCode::SigHashMismatch));
        assert!(err.to_string().contains("SIG_HASH_MISMATCH"));
    }

    #[test]
    fn test_runtime_failures_map_to_plugin_codes() {
        assert_eq!(
            PluginError::NotFound("aws".into()).code(),
            Some(ErrorCode::PluginNotFound)
        );
        assert_eq!(
            PluginError::Handshake {
                name: "aws".into(),
                reason: "no line".into()
            }
            .code(),
            Some(ErrorCode::PluginInvalid)
        );
    }
}
