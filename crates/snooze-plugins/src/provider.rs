//! The cloud provider capability, seen from both sides.
//!
//! [`CloudProvider`] is what plugin authors implement; the "current
//! instance" is whichever cloud resource the plugin selected from its
//! environment at startup (`INSTANCE_ID`, `AZURE_VM_NAME`, …).
//!
//! [`PluginHandle`] is the runtime's view of one loaded plugin: the same
//! operations, issued as RPCs, with authentication and permission gating
//! applied before any provider call leaves the agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use semver::Version;
use serde_json::json;
use snooze_core::InstanceInfo;
use snooze_security::{permissions, ErrorCode, SecurityError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::RpcChannel;
use crate::error::{PluginError, Result};
use crate::protocol::{
    methods, AuthenticateParams, AuthenticateResult, CheckPermissionParams,
    CheckPermissionResult, InstanceInfoResult, ListInstancesResult, ProviderCallResult,
    StringResult,
};
use crate::version::HOST_API_VERSION;

/// Default deadline for informational calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stop/start go to real cloud APIs, which are slow.
pub const PROVIDER_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of a stop/start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed {
        success: bool,
        error_message: Option<String>,
    },
    /// The deadline elapsed while the provider was still working; not a
    /// failure.
    InProgress,
}

impl OperationOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            OperationOutcome::Completed { success: true, .. }
        )
    }
}

/// Implemented by provider plugins. All operations act on the plugin's
/// current instance except [`CloudProvider::list_instances`].
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn api_version(&self) -> String {
        HOST_API_VERSION.to_string()
    }

    fn provider_name(&self) -> String;
    fn provider_version(&self) -> String;

    async fn instance_info(&self) -> anyhow::Result<InstanceInfo>;
    async fn stop_instance(&self) -> anyhow::Result<()>;
    async fn start_instance(&self) -> anyhow::Result<()>;
    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceInfo>>;
}

/// One loaded plugin: RPC channel plus the metadata captured at load.
pub struct PluginHandle {
    name: String,
    channel: RpcChannel,
    shutdown: CancellationToken,
    auth_enabled: bool,
    authenticated: AtomicBool,
    role: RwLock<Option<String>>,
    pub api_version: RwLock<Option<Version>>,
    pub provider_name: RwLock<Option<String>>,
    pub provider_version: RwLock<Option<String>>,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("auth_enabled", &self.auth_enabled)
            .field("authenticated", &self.authenticated)
            .field("role", &self.role)
            .field("api_version", &self.api_version)
            .field("provider_name", &self.provider_name)
            .field("provider_version", &self.provider_version)
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        channel: RpcChannel,
        shutdown: CancellationToken,
        auth_enabled: bool,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            shutdown,
            auth_enabled,
            authenticated: AtomicBool::new(false),
            role: RwLock::new(None),
            api_version: RwLock::new(None),
            provider_name: RwLock::new(None),
            provider_version: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Option<String> {
        self.role.read().clone()
    }

    /// Authenticate against the plugin's auth sub-capability and record
    /// the granted role. Called once during load.
    pub(crate) async fn authenticate(&self, api_key: &str) -> Result<String> {
        let result: AuthenticateResult = self
            .channel
            .call(
                methods::AUTHENTICATE,
                serde_json::to_value(AuthenticateParams {
                    plugin_name: self.name.clone(),
                    api_key: api_key.to_string(),
                })?,
                DEFAULT_CALL_TIMEOUT,
            )
            .await?;

        if !result.success {
            return Err(SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                .context("plugin", self.name.clone())
                .context(
                    "detail",
                    result.error.unwrap_or_else(|| "rejected by plugin".to_string()),
                )
                .into());
        }

        let role = result.role.ok_or_else(|| {
            PluginError::from(
                SecurityError::new(ErrorCode::AuthRoleInvalid).context("plugin", self.name.clone()),
            )
        })?;

        self.authenticated.store(true, Ordering::SeqCst);
        *self.role.write() = Some(role.clone());
        debug!(plugin = %self.name, role = %role, "plugin authenticated");
        Ok(role)
    }

    /// Gate applied before every cloud operation: authentication state,
    /// then a permission check RPC. Denial never reaches the provider.
    async fn ensure_cloud_permission(&self) -> Result<()> {
        if !self.auth_enabled {
            return Ok(());
        }
        if !self.is_authenticated() {
            return Err(SecurityError::new(ErrorCode::AuthApiKeyInvalid)
                .context("plugin", self.name.clone())
                .context("detail", "handle is not authenticated")
                .into());
        }

        let result: CheckPermissionResult = self
            .channel
            .call(
                methods::CHECK_PERMISSION,
                serde_json::to_value(CheckPermissionParams {
                    plugin_name: self.name.clone(),
                    permission: permissions::CLOUD_OPERATIONS.to_string(),
                })?,
                DEFAULT_CALL_TIMEOUT,
            )
            .await?;

        if !result.allowed {
            return Err(SecurityError::new(ErrorCode::AuthPermissionDenied)
                .context("plugin", self.name.clone())
                .context("permission", permissions::CLOUD_OPERATIONS)
                .into());
        }
        Ok(())
    }

    pub(crate) async fn get_api_version(&self) -> Result<String> {
        let result: StringResult = self
            .channel
            .call(methods::GET_API_VERSION, json!({}), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(result.value)
    }

    pub(crate) async fn get_provider_name(&self) -> Result<String> {
        let result: StringResult = self
            .channel
            .call(methods::GET_PROVIDER_NAME, json!({}), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(result.value)
    }

    pub(crate) async fn get_provider_version(&self) -> Result<String> {
        let result: StringResult = self
            .channel
            .call(methods::GET_PROVIDER_VERSION, json!({}), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(result.value)
    }

    pub async fn instance_info(&self) -> Result<InstanceInfo> {
        self.ensure_cloud_permission().await?;
        let result: InstanceInfoResult = self
            .channel
            .call(methods::GET_INSTANCE_INFO, json!({}), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(result.instance)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        self.ensure_cloud_permission().await?;
        let result: ListInstancesResult = self
            .channel
            .call(methods::LIST_INSTANCES, json!({}), DEFAULT_CALL_TIMEOUT)
            .await?;
        Ok(result.instances)
    }

    pub async fn stop_instance(&self) -> Result<OperationOutcome> {
        self.provider_op(methods::STOP_INSTANCE).await
    }

    pub async fn start_instance(&self) -> Result<OperationOutcome> {
        self.provider_op(methods::START_INSTANCE).await
    }

    async fn provider_op(&self, method: &str) -> Result<OperationOutcome> {
        self.ensure_cloud_permission().await?;

        match self
            .channel
            .call::<ProviderCallResult>(method, json!({}), PROVIDER_OP_TIMEOUT)
            .await
        {
            Ok(result) => Ok(OperationOutcome::Completed {
                success: result.success,
                error_message: result.error_message,
            }),
            Err(PluginError::Timeout { name, method }) => {
                warn!(plugin = %name, method = %method, "provider call still running at deadline");
                Ok(OperationOutcome::InProgress)
            }
            Err(e) => Err(e),
        }
    }

    /// Graceful shutdown: best-effort RPC, then cancel the reaper, which
    /// kills the subprocess after its grace period.
    pub async fn shutdown(&self) {
        let _ = self
            .channel
            .request(methods::SHUTDOWN, json!({}), Duration::from_secs(2))
            .await;
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success_predicate() {
        assert!(OperationOutcome::Completed {
            success: true,
            error_message: None
        }
        .succeeded());
        assert!(!OperationOutcome::Completed {
            success: false,
            error_message: Some("quota".to_string())
        }
        .succeeded());
        assert!(!OperationOutcome::InProgress.succeeded());
    }
}
