//! Client library for the snooze agent daemon.
//!
//! [`AgentClient`] speaks the newline-delimited JSON-RPC protocol from
//! `snooze-protocol` over one TCP connection. Calls are serialized on the
//! connection; the monitor's session task is the only caller in practice,
//! so there is no demand for pipelining.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use snooze_protocol::envelope::{RpcRequest, RpcResponse};
use snooze_protocol::methods;
use snooze_protocol::{
    HeartbeatRequest, HeartbeatResponse, IdleNotification, IdleResponse, InstanceRegistration,
    RegistrationResponse, SimpleAck, StateChangeReport, UnregisterRequest,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("call '{method}' timed out")]
    Timeout { method: String },

    #[error("agent returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct Inner {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A connection to the agent.
pub struct AgentClient {
    inner: tokio::sync::Mutex<Inner>,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl AgentClient {
    /// Connect to the agent at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected to agent");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            inner: tokio::sync::Mutex::new(Inner {
                reader: BufReader::new(read_half),
                writer: write_half,
            }),
            next_id: AtomicU64::new(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Raw JSON-RPC call. The typed wrappers below are preferred.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&RpcRequest::new(id, method, params))?;
        line.push('\n');
        trace!(method, id, "agent rpc");

        let mut inner = self.inner.lock().await;

        let exchange = async {
            inner.writer.write_all(line.as_bytes()).await?;
            inner.writer.flush().await?;

            let mut buf = String::new();
            loop {
                buf.clear();
                let n = inner.reader.read_line(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "agent closed the connection",
                    ));
                }
                if !buf.trim().is_empty() {
                    return Ok(buf.clone());
                }
            }
        };

        let response_line = match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => {
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                })
            }
        };

        let response: RpcResponse = serde_json::from_str(&response_line)
            .map_err(|e| ClientError::Protocol(format!("bad response: {}", e)))?;

        if response.id != id {
            return Err(ClientError::Protocol(format!(
                "response id {} for request {}",
                response.id, id
            )));
        }
        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn call_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: impl serde::Serialize,
    ) -> Result<T> {
        let value = self.call(method, serde_json::to_value(params)?).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("unexpected result for {}: {}", method, e)))
    }

    pub async fn register_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<RegistrationResponse> {
        self.call_typed(methods::INSTANCE_REGISTER, registration).await
    }

    pub async fn unregister_instance(&self, instance_id: &str) -> Result<SimpleAck> {
        self.call_typed(
            methods::INSTANCE_UNREGISTER,
            UnregisterRequest {
                instance_id: instance_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_heartbeat(&self, heartbeat: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.call_typed(methods::INSTANCE_HEARTBEAT, heartbeat).await
    }

    pub async fn send_idle_notification(
        &self,
        notification: &IdleNotification,
    ) -> Result<IdleResponse> {
        self.call_typed(methods::INSTANCE_IDLE, notification).await
    }

    pub async fn report_state_change(&self, report: &StateChangeReport) -> Result<SimpleAck> {
        self.call_typed(methods::INSTANCE_STATE_CHANGE, report).await
    }

    pub async fn ping(&self) -> Result<String> {
        let value = self.call(methods::AGENT_PING, Value::Null).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol("ping result is not a string".to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(methods::AGENT_SHUTDOWN, Value::Null).await?;
        Ok(())
    }
}
