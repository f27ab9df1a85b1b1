//! Out-of-process provider plugin runtime.
//!
//! Plugins are standalone executables discovered in a plugins directory.
//! The runtime spawns each one as a subprocess, exchanges a stdio
//! handshake (protocol version + magic cookie + listen address), then
//! speaks newline-delimited JSON-RPC to it over a local TCP connection,
//! optionally wrapped in mutual TLS issued by the runtime's embedded CA.
//!
//! The load pipeline applies, in fixed order: signature verification,
//! subprocess spawn + handshake, transport (plain or TLS), API-key
//! authentication, and API version compatibility. Each stage is
//! toggleable by configuration; any failure aborts the load and reaps the
//! subprocess. See [`runtime::PluginRuntime`].
//!
//! The [`serve`] module is the other half: plugin authors implement
//! [`provider::CloudProvider`] and hand it to [`serve::serve`].

pub mod channel;
pub mod discovery;
pub mod error;
pub mod process;
pub mod protocol;
pub mod provider;
pub mod runtime;
pub mod serve;
pub mod version;

pub use error::{PluginError, Result};
pub use provider::{CloudProvider, OperationOutcome, PluginHandle};
pub use runtime::{PluginRuntime, RuntimeConfig};
