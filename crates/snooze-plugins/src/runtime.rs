//! The plugin runtime: discovery, the load pipeline, and the table of
//! loaded plugins.
//!
//! Signature, authentication and TLS policies are applied in a fixed
//! order inside [`PluginRuntime::load`], each independently toggleable.
//! There is no wrapper layering: one runtime, one pipeline.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use snooze_security::{
    CertAuthority, ErrorCode, EventLevel, SecurityError, SecurityEvent, SecurityEventSink,
    SignatureConfig, SignatureService,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::RpcChannel;
use crate::discovery;
use crate::error::{PluginError, Result};
use crate::process::PluginProcess;
use crate::protocol;
use crate::provider::PluginHandle;
use crate::version;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn env_toggle(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("on") | Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Runtime settings, normally read from the environment contract set by
/// the service wrappers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub plugins_dir: PathBuf,
    pub config_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub signatures_dir: PathBuf,
    pub tls: bool,
    /// Insecure: accept any server certificate. Local debugging only.
    pub tls_skip_verify: bool,
    pub verify_signatures: bool,
    pub auth: bool,
    pub api_key: Option<String>,
}

impl RuntimeConfig {
    /// All security features off; suitable for tests and development.
    pub fn insecure(base_dir: impl Into<PathBuf>) -> Self {
        let base = base_dir.into();
        Self {
            plugins_dir: base.join("plugins"),
            config_dir: base.join("config"),
            cert_dir: base.join("certs"),
            signatures_dir: base.join("signatures"),
            tls: false,
            tls_skip_verify: false,
            verify_signatures: false,
            auth: false,
            api_key: None,
        }
    }

    /// Read the `SNOOZE_*` environment contract.
    pub fn from_env() -> Self {
        let dir = |name: &str, default: &str| {
            env::var(name)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default))
        };

        Self {
            plugins_dir: dir("SNOOZE_PLUGINS_DIR", "/etc/snooze/plugins"),
            config_dir: dir("SNOOZE_CONFIG_DIR", "/etc/snooze"),
            cert_dir: dir("SNOOZE_CERT_DIR", "/etc/snooze/certs"),
            signatures_dir: dir("SNOOZE_SIGNATURE_DIR", "/etc/snooze/signatures"),
            tls: env_toggle("SNOOZE_TLS"),
            tls_skip_verify: env_toggle("SNOOZE_TLS_SKIP_VERIFY"),
            verify_signatures: env_toggle("SNOOZE_SIGNATURE_CHECK"),
            auth: env_toggle("SNOOZE_AUTH"),
            api_key: env::var("SNOOZE_API_KEY").ok(),
        }
    }
}

type PluginTable = Arc<RwLock<HashMap<String, Arc<PluginHandle>>>>;

/// Owns the loaded-plugin table and everything needed to fill it.
pub struct PluginRuntime {
    config: RuntimeConfig,
    signatures: SignatureService,
    certs: CertAuthority,
    events: Arc<SecurityEventSink>,
    // Shared with reaper tasks (as Weak) so an unexpected subprocess
    // exit removes its own table entry.
    loaded: PluginTable,
}

impl PluginRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let mut sig_config =
            SignatureConfig::load_or_default(&config.config_dir.join("signature_config.json"));
        sig_config.enabled = config.verify_signatures;

        let events = Arc::new(SecurityEventSink::new(config.config_dir.join("events")));
        let certs = CertAuthority::new(config.cert_dir.clone());

        Self {
            signatures: SignatureService::new(sig_config),
            certs,
            events,
            loaded: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn signatures(&self) -> &SignatureService {
        &self.signatures
    }

    pub fn certs(&self) -> &CertAuthority {
        &self.certs
    }

    pub fn events(&self) -> &Arc<SecurityEventSink> {
        &self.events
    }

    /// Basenames of the executables available for loading.
    pub fn discover(&self) -> Result<Vec<String>> {
        discovery::discover(&self.config.plugins_dir)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginHandle>> {
        self.loaded.read().get(name).cloned()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Load a plugin through the full pipeline, or return the existing
    /// handle if it is already loaded.
    pub async fn load(&self, name: &str) -> Result<Arc<PluginHandle>> {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }

        match self.load_pipeline(name).await {
            Ok(handle) => {
                self.audit(
                    EventLevel::Info,
                    "plugin_loaded",
                    name,
                    format!("plugin '{}' loaded", name),
                    true,
                );
                Ok(handle)
            }
            Err(e) => {
                self.audit(
                    EventLevel::Error,
                    "plugin_load_failed",
                    name,
                    e.to_string(),
                    false,
                );
                Err(e)
            }
        }
    }

    async fn load_pipeline(&self, name: &str) -> Result<Arc<PluginHandle>> {
        // 1. Resolve the binary.
        let path = discovery::resolve(&self.config.plugins_dir, name)?;

        // 2. Signature policy.
        if self.config.verify_signatures {
            self.signatures
                .verify_plugin(name, &path, &self.config.signatures_dir)?;
            self.audit(
                EventLevel::Info,
                "signature_verified",
                name,
                format!("signature for '{}' verified", name),
                true,
            );
        }

        // 3. Certificate material must exist before the child does, so
        //    both sides read one CA instead of racing to create it.
        if self.config.tls {
            self.certs.ensure_leaf(name)?;
        }

        // 4. Spawn and handshake over stdio.
        let mut extra_env = HashMap::new();
        extra_env.insert(
            protocol::env::CONFIG_DIR.to_string(),
            self.config.config_dir.display().to_string(),
        );
        extra_env.insert(
            protocol::env::CERT_DIR.to_string(),
            self.config.cert_dir.display().to_string(),
        );
        extra_env.insert(
            protocol::env::TLS.to_string(),
            if self.config.tls { "on" } else { "off" }.to_string(),
        );

        let mut process = PluginProcess::spawn(name, &path, extra_env).await?;

        // 5. Transport: TCP to the handshake address, TLS-wrapped when
        //    enabled. Every later failure must reap the child.
        let channel = match self.open_channel(name, &process).await {
            Ok(channel) => channel,
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let handle = Arc::new(PluginHandle::new(
            name,
            channel,
            shutdown.clone(),
            self.config.auth,
        ));

        if let Err(e) = self.interrogate(name, &handle).await {
            process.kill().await;
            return Err(e);
        }

        // 6. Record, and hand the child to the reaper so an unexpected
        //    exit removes the table entry.
        self.loaded
            .write()
            .insert(name.to_string(), handle.clone());

        let table_name = name.to_string();
        let loaded = Arc::downgrade(&self.loaded);
        let events = self.events.clone();
        process.spawn_reaper(shutdown, move |status| {
            if let Some(loaded) = loaded.upgrade() {
                if loaded.write().remove(&table_name).is_some() {
                    if let Some(status) = status.filter(|s| !s.success()) {
                        events.emit(
                            SecurityEvent::new(
                                EventLevel::Warn,
                                "plugin",
                                "plugin_exited",
                                format!("plugin '{}' exited: {}", table_name, status),
                                "plugin_runtime",
                                false,
                            )
                            .plugin(table_name.clone()),
                        );
                    }
                }
            }
        });

        info!(
            plugin = name,
            provider = handle.provider_name.read().as_deref().unwrap_or("?"),
            "plugin loaded"
        );
        Ok(handle)
    }

    async fn open_channel(&self, name: &str, process: &PluginProcess) -> Result<RpcChannel> {
        let addr = process.handshake.address;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PluginError::Handshake {
                name: name.to_string(),
                reason: format!("connect to {} timed out", addr),
            })?
            .map_err(|e| PluginError::Handshake {
                name: name.to_string(),
                reason: format!("connect to {} failed: {}", addr, e),
            })?;

        if !self.config.tls {
            return Ok(RpcChannel::new(name, stream));
        }

        let config = self.certs.client_config(self.config.tls_skip_verify)?;
        let server_name = ServerName::try_from(name.to_string()).map_err(|e| {
            PluginError::from(
                SecurityError::with_cause(ErrorCode::TlsInit, e).context("plugin", name.to_string()),
            )
        })?;

        let tls = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| {
                PluginError::from(
                    SecurityError::with_cause(ErrorCode::TlsHandshake, e)
                        .context("plugin", name.to_string()),
                )
            })?;

        debug!(plugin = name, "mutual TLS established");
        Ok(RpcChannel::new(name, tls))
    }

    /// Authenticate (when enabled) and capture version/provider metadata.
    async fn interrogate(&self, name: &str, handle: &PluginHandle) -> Result<()> {
        if self.config.auth {
            let api_key = self.config.api_key.as_deref().ok_or_else(|| {
                PluginError::from(
                    SecurityError::new(ErrorCode::AuthInit)
                        .context("detail", "authentication enabled but no API key configured"),
                )
            })?;

            match handle.authenticate(api_key).await {
                Ok(role) => self.audit(
                    EventLevel::Info,
                    "auth_success",
                    name,
                    format!("plugin '{}' authenticated with role '{}'", name, role),
                    true,
                ),
                Err(e) => {
                    self.audit(EventLevel::Error, "auth_failure", name, e.to_string(), false);
                    return Err(e);
                }
            }
        }

        let reported = handle.get_api_version().await?;
        let api_version = version::check_compatibility(name, &reported)?;
        *handle.api_version.write() = Some(api_version);

        *handle.provider_name.write() = Some(handle.get_provider_name().await?);
        *handle.provider_version.write() = Some(handle.get_provider_version().await?);
        Ok(())
    }

    /// Unload a plugin: graceful shutdown RPC, then reaper-driven kill.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let handle = {
            self.loaded
                .write()
                .remove(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?
        };

        handle.shutdown().await;
        self.audit(
            EventLevel::Info,
            "plugin_unloaded",
            name,
            format!("plugin '{}' unloaded", name),
            true,
        );
        Ok(())
    }

    /// Unload everything; used on agent shutdown.
    pub async fn shutdown_all(&self) {
        let names = self.loaded_names();
        for name in names {
            if let Err(e) = self.unload(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
    }

    fn audit(
        &self,
        level: EventLevel,
        event_type: &str,
        plugin: &str,
        message: String,
        success: bool,
    ) {
        self.events.emit(
            SecurityEvent::new(level, "plugin", event_type, message, "plugin_runtime", success)
                .plugin(plugin),
        );
    }
}
