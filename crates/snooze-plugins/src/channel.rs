//! JSON-RPC channel to one plugin subprocess.
//!
//! Calls are serialized: one request/response in flight per plugin at a
//! time, which matches how the agent drives providers (per-instance
//! operations are already ordered upstream by the registry).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use snooze_protocol::envelope::{RpcRequest, RpcResponse};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::{PluginError, Result};

struct Inner {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

pub struct RpcChannel {
    name: String,
    inner: tokio::sync::Mutex<Inner>,
    next_id: AtomicU64,
}

impl RpcChannel {
    pub fn new<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        Self {
            name: name.into(),
            inner: tokio::sync::Mutex::new(Inner {
                reader: BufReader::new(read_half),
                writer: Box::new(write_half),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issue one call and await its response, bounded by `deadline`.
    pub async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;
        trace!(plugin = %self.name, method, id, "plugin rpc");

        let mut inner = self.inner.lock().await;

        let exchange = async {
            inner.writer.write_all(line.as_bytes()).await?;
            inner.writer.write_all(b"\n").await?;
            inner.writer.flush().await?;

            let mut buf = String::new();
            loop {
                buf.clear();
                let n = inner.reader.read_line(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "plugin closed the connection",
                    ));
                }
                if buf.trim().is_empty() {
                    continue;
                }
                return Ok(buf.clone());
            }
        };

        let line = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                return Err(PluginError::Communication {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PluginError::Timeout {
                    name: self.name.clone(),
                    method: method.to_string(),
                })
            }
        };

        let response: RpcResponse =
            serde_json::from_str(&line).map_err(|e| PluginError::Communication {
                name: self.name.clone(),
                reason: format!("bad response: {}", e),
            })?;

        if response.id != id {
            return Err(PluginError::Communication {
                name: self.name.clone(),
                reason: format!("response id {} for request {}", response.id, id),
            });
        }

        if let Some(error) = response.error {
            return Err(PluginError::Rpc {
                name: self.name.clone(),
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Typed variant of [`RpcChannel::request`].
    pub async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<T> {
        let value = self.request(method, params, deadline).await?;
        serde_json::from_value(value).map_err(|e| PluginError::Communication {
            name: self.name.clone(),
            reason: format!("unexpected result shape for {}: {}", method, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snooze_protocol::envelope;
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal peer: answers every request with `{"echo": <method>}`.
    async fn echo_peer(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: RpcRequest = serde_json::from_str(&line).unwrap();
            let response = RpcResponse::success(request.id, json!({"echo": request.method}));
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            write_half.write_all(out.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(echo_peer(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let channel = RpcChannel::new("test", stream);

        let result = channel
            .request("provider.get_provider_name", json!({}), Duration::from_secs(5))
            .await
            .expect("round trip");
        assert_eq!(result["echo"], "provider.get_provider_name");
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_with_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let request: RpcRequest = serde_json::from_str(&line).unwrap();
                let response = RpcResponse::failure(
                    request.id,
                    envelope::codes::METHOD_NOT_FOUND,
                    "no such method",
                );
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                write_half.write_all(out.as_bytes()).await.unwrap();
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let channel = RpcChannel::new("test", stream);
        let err = channel
            .request("bogus", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            PluginError::Rpc { code, .. } => assert_eq!(code, envelope::codes::METHOD_NOT_FOUND),
            other => panic!("expected Rpc error, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the socket without ever replying.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let channel = RpcChannel::new("test", stream);
        let err = channel
            .request("provider.stop_instance", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Timeout { .. }), "{}", err);
    }
}
