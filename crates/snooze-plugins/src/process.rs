//! Plugin subprocess lifecycle: spawn, handshake, reap.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{PluginError, Result};
use crate::protocol::{self, Handshake, COOKIE_KEY, COOKIE_VALUE, PROTOCOL_VERSION};

/// How long a freshly spawned plugin gets to print its handshake line.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between the shutdown RPC and an OS-level kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A spawned plugin subprocess that has completed its handshake.
#[derive(Debug)]
pub struct PluginProcess {
    name: String,
    child: Option<Child>,
    pub handshake: Handshake,
}

impl PluginProcess {
    /// Spawn the binary at `path` and await its handshake line.
    ///
    /// The child inherits the magic cookie and its own name through the
    /// environment; anything in `extra_env` is layered on top. On any
    /// failure the child is killed before the error is returned.
    pub async fn spawn(
        name: &str,
        path: &Path,
        extra_env: HashMap<String, String>,
    ) -> Result<Self> {
        let mut command = Command::new(path);
        command
            .env(COOKIE_KEY, COOKIE_VALUE)
            .env(protocol::env::PLUGIN_NAME, name)
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| PluginError::Handshake {
            name: name.to_string(),
            reason: format!("spawn failed: {}", e),
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                kill_quietly(&mut child).await;
                return Err(PluginError::Handshake {
                    name: name.to_string(),
                    reason: "exited before handshake".to_string(),
                });
            }
            Ok(Err(e)) => {
                kill_quietly(&mut child).await;
                return Err(PluginError::Handshake {
                    name: name.to_string(),
                    reason: format!("stdout read failed: {}", e),
                });
            }
            Err(_) => {
                kill_quietly(&mut child).await;
                return Err(PluginError::Handshake {
                    name: name.to_string(),
                    reason: format!("no handshake within {:?}", HANDSHAKE_TIMEOUT),
                });
            }
        };

        let handshake = match Handshake::parse(&line) {
            Ok(handshake) => handshake,
            Err(reason) => {
                kill_quietly(&mut child).await;
                return Err(PluginError::Handshake {
                    name: name.to_string(),
                    reason,
                });
            }
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            kill_quietly(&mut child).await;
            return Err(PluginError::Handshake {
                name: name.to_string(),
                reason: format!(
                    "protocol version {} (host speaks {})",
                    handshake.protocol_version, PROTOCOL_VERSION
                ),
            });
        }

        // Keep the child's stderr visible in our diagnostics.
        if let Some(stderr) = child.stderr.take() {
            let plugin = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(plugin = %plugin, "{}", line);
                }
            });
        }

        debug!(plugin = name, addr = %handshake.address, "plugin handshake complete");
        Ok(Self {
            name: name.to_string(),
            child: Some(child),
            handshake,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kill the subprocess immediately. Used when a later load stage
    /// fails and the process must not outlive the failed load.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            kill_quietly(child).await;
        }
        self.child = None;
    }

    /// Hand the child off to a reaper task.
    ///
    /// The reaper resolves when the child exits on its own (crash) or
    /// when `shutdown` fires, in which case the child gets
    /// [`SHUTDOWN_GRACE`] to exit after the graceful shutdown RPC before
    /// being killed. `on_exit` runs exactly once, with the exit status if
    /// one was observed.
    pub fn spawn_reaper<F>(
        mut self,
        shutdown: CancellationToken,
        on_exit: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        let name = self.name.clone();
        let mut child = self.child.take().expect("child present");

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    warn!(plugin = %name, status = ?status, "plugin exited on its own");
                    on_exit(status.ok());
                }
                _ = shutdown.cancelled() => {
                    let status = match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                        Ok(status) => status.ok(),
                        Err(_) => {
                            debug!(plugin = %name, "grace period elapsed, killing");
                            let _ = child.start_kill();
                            child.wait().await.ok()
                        }
                    };
                    on_exit(status);
                }
            }
        })
    }
}

async fn kill_quietly(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
