//! Shared protocol types for monitor ↔ agent communication.
//!
//! The wire is newline-delimited JSON-RPC 2.0 over TCP: one request per
//! line, one response per line. This crate owns the envelope and every
//! typed request/response body; it has no I/O of its own. The agent's
//! server and the `snooze-rpc` client both build on these shapes, which
//! keeps the two ends from drifting apart.

pub mod envelope;
pub mod messages;
pub mod methods;

pub use envelope::{RpcErrorObject, RpcRequest, RpcResponse, JSONRPC_VERSION};
pub use messages::{
    HeartbeatRequest, HeartbeatResponse, IdleAction, IdleNotification, IdleResponse,
    InstanceRegistration, MonitorCommand, RegistrationResponse, SimpleAck, StateChangeReport,
    UnregisterRequest,
};
