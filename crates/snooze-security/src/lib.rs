//! Security services for the snooze plugin runtime.
//!
//! Four independent concerns, each toggleable by configuration:
//!
//! - **Signing keys and plugin signatures** ([`keys`], [`signature`]):
//!   RSA-2048 keypairs, detached `.sig` records, SHA-256 hash verification
//!   with a size/mtime-keyed cache.
//! - **API keys and roles** ([`auth`]): one opaque key per plugin,
//!   permission checks against named roles.
//! - **Embedded CA and TLS** ([`tls`]): a self-managed certificate
//!   authority issuing per-plugin leaf certificates for mutual TLS.
//! - **Security events** ([`events`]): an append-only, size-rotated
//!   JSON-lines audit trail with per-event-type callbacks.
//!
//! Every failure carries a stable [`ErrorCode`]; the code-to-guidance
//! mapping in [`error`] is part of the public contract.

pub mod auth;
pub mod error;
pub mod events;
pub mod keys;
pub mod signature;
pub mod tls;

pub use auth::{ApiKey, AuthStore, Role, SecurityFile};
pub use error::{ErrorCode, Result, SecurityError};
pub use events::{EventLevel, SecurityEvent, SecurityEventSink};
pub use keys::{KeyStore, SigningKey};
pub use signature::{PluginSignature, SignatureConfig, SignatureService};
pub use tls::CertAuthority;

/// Permission names known to the predefined roles.
pub mod permissions {
    pub const CLOUD_OPERATIONS: &str = "cloud_operations";
    pub const FILESYSTEM_READ: &str = "filesystem_read";
    pub const FILESYSTEM_WRITE: &str = "filesystem_write";
    pub const NETWORK_OUTBOUND: &str = "network_outbound";
}
