//! Agent ↔ plugin wire protocol: handshake and RPC method surface.
//!
//! The handshake happens once at process attach. The parent passes the
//! magic cookie through the child's environment; the child verifies it,
//! binds a loopback listener and prints exactly one line to stdout:
//!
//! ```text
//! <protocol-version>|<socket-addr>
//! ```
//!
//! Everything after that is newline-delimited JSON-RPC on the socket,
//! using the same envelope as the monitor/agent protocol.

use serde::{Deserialize, Serialize};
use snooze_core::InstanceInfo;

/// Version of the handshake/transport protocol, not of the provider API.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic cookie pair. The value is an arbitrary fixed string: its only
/// purpose is to stop users from launching plugin binaries by hand.
pub const COOKIE_KEY: &str = "SNOOZE_PLUGIN_COOKIE";
pub const COOKIE_VALUE: &str = "0qOhMgeQAnG9dVVrYxyAnsDdZmVBdLcX";

/// Environment passed from runtime to plugin child processes.
pub mod env {
    pub const PLUGIN_NAME: &str = "SNOOZE_PLUGIN_NAME";
    pub const CONFIG_DIR: &str = "SNOOZE_CONFIG_DIR";
    pub const CERT_DIR: &str = "SNOOZE_CERT_DIR";
    pub const TLS: &str = "SNOOZE_TLS";
}

/// RPC method names the plugin side must dispatch.
pub mod methods {
    pub const GET_API_VERSION: &str = "provider.get_api_version";
    pub const GET_PROVIDER_NAME: &str = "provider.get_provider_name";
    pub const GET_PROVIDER_VERSION: &str = "provider.get_provider_version";
    pub const GET_INSTANCE_INFO: &str = "provider.get_instance_info";
    pub const STOP_INSTANCE: &str = "provider.stop_instance";
    pub const START_INSTANCE: &str = "provider.start_instance";
    pub const LIST_INSTANCES: &str = "provider.list_instances";
    pub const SHUTDOWN: &str = "provider.shutdown";

    pub const AUTHENTICATE: &str = "auth.authenticate";
    pub const CHECK_PERMISSION: &str = "auth.check_permission";
}

/// Result of the one-line stdout handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub address: std::net::SocketAddr,
}

impl Handshake {
    /// Parse a `version|addr` handshake line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (version, addr) = line
            .split_once('|')
            .ok_or_else(|| format!("malformed handshake line: {:?}", line))?;

        let protocol_version: u32 = version
            .parse()
            .map_err(|_| format!("bad protocol version: {:?}", version))?;
        let address = addr
            .parse()
            .map_err(|_| format!("bad listen address: {:?}", addr))?;

        Ok(Self {
            protocol_version,
            address,
        })
    }

    pub fn line(&self) -> String {
        format!("{}|{}", self.protocol_version, self.address)
    }
}

/// `{success, error_message?}` result of a provider stop/start call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfoResult {
    pub instance: InstanceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInstancesResult {
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateParams {
    pub plugin_name: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPermissionParams {
    pub plugin_name: String,
    pub permission: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPermissionResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// String results (`get_provider_name` and friends) share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringResult {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake {
            protocol_version: PROTOCOL_VERSION,
            address: "127.0.0.1:45123".parse().unwrap(),
        };
        let parsed = Handshake::parse(&handshake.line()).expect("parse");
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_handshake_rejects_garbage() {
        assert!(Handshake::parse("").is_err());
        assert!(Handshake::parse("1").is_err());
        assert!(Handshake::parse("one|127.0.0.1:80").is_err());
        assert!(Handshake::parse("1|not-an-addr").is_err());
    }

    #[test]
    fn test_handshake_tolerates_trailing_newline() {
        let parsed = Handshake::parse("1|127.0.0.1:9000\n").expect("parse");
        assert_eq!(parsed.protocol_version, 1);
    }
}
