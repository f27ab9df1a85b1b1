//! Plugin-side runtime: implement [`CloudProvider`], call [`serve`].
//!
//! `serve` validates the magic cookie from the environment, binds a
//! loopback listener, prints the handshake line and then answers the
//! runtime's JSON-RPC until a shutdown request or disconnect. When the
//! runtime enabled TLS, the plugin terminates it with the leaf
//! certificate issued for its own name under the shared certificate
//! directory.

use std::env;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use snooze_protocol::envelope::{codes, RpcRequest, RpcResponse};
use snooze_security::{AuthStore, CertAuthority, ErrorCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{PluginError, Result};
use crate::protocol::{
    self, methods, AuthenticateParams, AuthenticateResult, CheckPermissionParams,
    CheckPermissionResult, Handshake, InstanceInfoResult, ListInstancesResult,
    ProviderCallResult, StringResult, COOKIE_KEY, COOKIE_VALUE, PROTOCOL_VERSION,
};
use crate::provider::CloudProvider;

/// Settings a plugin process reads from the environment the runtime set.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub name: String,
    pub config_dir: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub tls: bool,
}

impl ServeConfig {
    /// Validate the magic cookie and collect settings. A missing or wrong
    /// cookie means the binary was launched by hand, not by the runtime.
    pub fn from_env() -> Result<Self> {
        let cookie = env::var(COOKIE_KEY).unwrap_or_default();
        if cookie != COOKIE_VALUE {
            return Err(PluginError::Handshake {
                name: env::var(protocol::env::PLUGIN_NAME).unwrap_or_else(|_| "?".to_string()),
                reason: "magic cookie missing; this binary is a snooze plugin and must be \
                         launched by the snooze agent"
                    .to_string(),
            });
        }

        let name = env::var(protocol::env::PLUGIN_NAME).map_err(|_| PluginError::Handshake {
            name: "?".to_string(),
            reason: "SNOOZE_PLUGIN_NAME not set".to_string(),
        })?;

        Ok(Self {
            name,
            config_dir: env::var(protocol::env::CONFIG_DIR).ok().map(PathBuf::from),
            cert_dir: env::var(protocol::env::CERT_DIR).ok().map(PathBuf::from),
            tls: env::var(protocol::env::TLS).as_deref() == Ok("on"),
        })
    }
}

/// Run the plugin main loop with environment-derived configuration.
pub async fn serve<P: CloudProvider + 'static>(provider: P) -> Result<()> {
    let config = ServeConfig::from_env()?;
    serve_with(config, provider).await
}

/// Run the plugin main loop with explicit configuration.
pub async fn serve_with<P: CloudProvider + 'static>(
    config: ServeConfig,
    provider: P,
) -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handshake = Handshake {
        protocol_version: PROTOCOL_VERSION,
        address: addr,
    };
    // The handshake must reach the parent before it attempts to connect.
    println!("{}", handshake.line());
    std::io::stdout().flush().ok();

    let auth = config
        .config_dir
        .as_ref()
        .and_then(|dir| AuthStore::open(dir.join("security.json")).ok());

    let (stream, peer) = listener.accept().await?;
    debug!(plugin = %config.name, peer = %peer, "runtime connected");

    let provider: Arc<dyn CloudProvider> = Arc::new(provider);

    if config.tls {
        let cert_dir = config.cert_dir.clone().ok_or_else(|| PluginError::Handshake {
            name: config.name.clone(),
            reason: "TLS enabled but no certificate directory provided".to_string(),
        })?;
        let server_config = CertAuthority::new(cert_dir).server_config(&config.name)?;
        let stream = TlsAcceptor::from(server_config)
            .accept(stream)
            .await
            .map_err(|e| PluginError::Communication {
                name: config.name.clone(),
                reason: format!("TLS accept failed: {}", e),
            })?;
        dispatch_loop(stream, &config.name, provider, auth).await
    } else {
        dispatch_loop(stream, &config.name, provider, auth).await
    }
}

async fn dispatch_loop<S>(
    stream: S,
    name: &str,
    provider: Arc<dyn CloudProvider>,
    auth: Option<AuthStore>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(plugin = name, error = %e, "unparsable request");
                write_response(
                    &mut write_half,
                    RpcResponse::failure(0, codes::PARSE_ERROR, e.to_string()),
                )
                .await?;
                continue;
            }
        };

        let shutdown = request.method == methods::SHUTDOWN;
        let response = handle(name, &provider, auth.as_ref(), request).await;
        write_response(&mut write_half, response).await?;

        if shutdown {
            info!(plugin = name, "shutdown requested");
            break;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: RpcResponse) -> Result<()> {
    let mut line = serde_json::to_string(&response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn handle(
    name: &str,
    provider: &Arc<dyn CloudProvider>,
    auth: Option<&AuthStore>,
    request: RpcRequest,
) -> RpcResponse {
    let id = request.id;

    let result: std::result::Result<Value, (i64, String)> = match request.method.as_str() {
        methods::GET_API_VERSION => string_result(provider.api_version()),
        methods::GET_PROVIDER_NAME => string_result(provider.provider_name()),
        methods::GET_PROVIDER_VERSION => string_result(provider.provider_version()),

        methods::GET_INSTANCE_INFO => match provider.instance_info().await {
            Ok(instance) => to_value(InstanceInfoResult { instance }),
            Err(e) => Err((codes::INTERNAL_ERROR, e.to_string())),
        },

        methods::LIST_INSTANCES => match provider.list_instances().await {
            Ok(instances) => to_value(ListInstancesResult { instances }),
            Err(e) => Err((codes::INTERNAL_ERROR, e.to_string())),
        },

        // Provider failures on stop/start are data, not RPC errors: the
        // agent needs the error message for retry/notification decisions.
        methods::STOP_INSTANCE => to_value(call_result(provider.stop_instance().await)),
        methods::START_INSTANCE => to_value(call_result(provider.start_instance().await)),

        methods::SHUTDOWN => to_value(json!({"success": true})),

        methods::AUTHENTICATE => match serde_json::from_value::<AuthenticateParams>(request.params)
        {
            Ok(params) => to_value(authenticate(name, auth, &params)),
            Err(e) => Err((codes::INVALID_PARAMS, e.to_string())),
        },

        methods::CHECK_PERMISSION => {
            match serde_json::from_value::<CheckPermissionParams>(request.params) {
                Ok(params) => to_value(check_permission(auth, &params)),
                Err(e) => Err((codes::INVALID_PARAMS, e.to_string())),
            }
        }

        other => Err((codes::METHOD_NOT_FOUND, format!("unknown method '{}'", other))),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err((code, message)) => RpcResponse::failure(id, code, message),
    }
}

fn authenticate(
    name: &str,
    auth: Option<&AuthStore>,
    params: &AuthenticateParams,
) -> AuthenticateResult {
    let Some(store) = auth.filter(|s| s.is_enabled()) else {
        // Authentication not configured on this host: accept and grant
        // the default provider role.
        return AuthenticateResult {
            success: true,
            role: Some(snooze_security::auth::ROLE_CLOUD_PROVIDER.to_string()),
            error: None,
        };
    };

    if params.plugin_name != name {
        return AuthenticateResult {
            success: false,
            role: None,
            error: Some(format!(
                "key presented for '{}' but this plugin is '{}'",
                params.plugin_name, name
            )),
        };
    }

    match store.validate(&params.plugin_name, &params.api_key) {
        Ok(role) => AuthenticateResult {
            success: true,
            role: Some(role.name),
            error: None,
        },
        Err(e) => AuthenticateResult {
            success: false,
            role: None,
            error: Some(e.to_string()),
        },
    }
}

fn check_permission(
    auth: Option<&AuthStore>,
    params: &CheckPermissionParams,
) -> CheckPermissionResult {
    let Some(store) = auth.filter(|s| s.is_enabled()) else {
        return CheckPermissionResult {
            allowed: true,
            error: None,
        };
    };

    match store.check_permission(&params.plugin_name, &params.permission) {
        Ok(()) => CheckPermissionResult {
            allowed: true,
            error: None,
        },
        Err(e) if e.code == ErrorCode::AuthPermissionDenied => CheckPermissionResult {
            allowed: false,
            error: None,
        },
        Err(e) => CheckPermissionResult {
            allowed: false,
            error: Some(e.to_string()),
        },
    }
}

fn call_result(result: anyhow::Result<()>) -> ProviderCallResult {
    match result {
        Ok(()) => ProviderCallResult {
            success: true,
            error_message: None,
        },
        Err(e) => ProviderCallResult {
            success: false,
            error_message: Some(e.to_string()),
        },
    }
}

fn string_result(value: String) -> std::result::Result<Value, (i64, String)> {
    to_value(StringResult { value })
}

fn to_value<T: serde::Serialize>(value: T) -> std::result::Result<Value, (i64, String)> {
    serde_json::to_value(value).map_err(|e| (codes::INTERNAL_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snooze_core::{InstanceInfo, InstanceState};

    struct FakeProvider;

    #[async_trait]
    impl CloudProvider for FakeProvider {
        fn provider_name(&self) -> String {
            "fake".to_string()
        }
        fn provider_version(&self) -> String {
            "0.0.1".to_string()
        }
        async fn instance_info(&self) -> anyhow::Result<InstanceInfo> {
            Ok(InstanceInfo {
                instance_id: "i-1".to_string(),
                instance_type: "t3.micro".to_string(),
                region: "us-east-1".to_string(),
                zone: "us-east-1a".to_string(),
                provider: "fake".to_string(),
                state: InstanceState::Running,
            })
        }
        async fn stop_instance(&self) -> anyhow::Result<()> {
            anyhow::bail!("stop is broken")
        }
        async fn start_instance(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_instances(&self) -> anyhow::Result<Vec<InstanceInfo>> {
            Ok(vec![])
        }
    }

    fn provider() -> Arc<dyn CloudProvider> {
        Arc::new(FakeProvider)
    }

    #[tokio::test]
    async fn test_handle_provider_name() {
        let request = RpcRequest::new(1, methods::GET_PROVIDER_NAME, json!({}));
        let response = handle("fake", &provider(), None, request).await;
        assert!(response.is_success());
        assert_eq!(response.result.unwrap()["value"], "fake");
    }

    #[tokio::test]
    async fn test_stop_failure_is_data_not_rpc_error() {
        let request = RpcRequest::new(2, methods::STOP_INSTANCE, json!({}));
        let response = handle("fake", &provider(), None, request).await;
        assert!(response.is_success(), "failure travels in the result");
        let result = response.result.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error_message"]
            .as_str()
            .unwrap()
            .contains("stop is broken"));
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let request = RpcRequest::new(3, "provider.fly_to_moon", json!({}));
        let response = handle("fake", &provider(), None, request).await;
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_disabled_grants_default_role() {
        let request = RpcRequest::new(
            4,
            methods::AUTHENTICATE,
            json!({"plugin_name": "fake", "api_key": "whatever"}),
        );
        let response = handle("fake", &provider(), None, request).await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["role"], "cloud_provider");
    }

    #[tokio::test]
    async fn test_check_permission_disabled_allows() {
        let request = RpcRequest::new(
            5,
            methods::CHECK_PERMISSION,
            json!({"plugin_name": "fake", "permission": "cloud_operations"}),
        );
        let response = handle("fake", &provider(), None, request).await;
        assert_eq!(response.result.unwrap()["allowed"], true);
    }
}
