//! Mock provider plugin.
//!
//! Serves the cloud provider capability against in-memory state. The
//! current instance comes from `INSTANCE_ID`; everything else can be
//! overridden through `<config_dir>/mock_plugin.json`, which keeps
//! concurrently running integration tests isolated from each other
//! (process environment is shared, config directories are not).
//!
//! ```json
//! {"provider": "mock", "api_version": "1.1.0", "fail_stop": true,
//!  "stop_delay_ms": 0, "instance_id": "i-1"}
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use snooze_core::{InstanceInfo, InstanceState};
use snooze_plugins::version::HOST_API_VERSION;
use snooze_plugins::CloudProvider;

#[derive(Debug, Default, Deserialize)]
struct Overrides {
    instance_id: Option<String>,
    provider: Option<String>,
    api_version: Option<String>,
    #[serde(default)]
    fail_stop: bool,
    #[serde(default)]
    stop_delay_ms: u64,
}

impl Overrides {
    fn load() -> Self {
        let Some(dir) = env::var("SNOOZE_CONFIG_DIR").ok().map(PathBuf::from) else {
            return Self::default();
        };
        let path = dir.join("mock_plugin.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

struct MockProvider {
    instance_id: String,
    provider_name: String,
    api_version: String,
    fail_stop: bool,
    stop_delay: Duration,
    state: Mutex<InstanceState>,
}

impl MockProvider {
    fn from_env() -> Self {
        let overrides = Overrides::load();
        Self {
            instance_id: overrides
                .instance_id
                .or_else(|| env::var("INSTANCE_ID").ok())
                .unwrap_or_else(|| "i-mock0001".to_string()),
            provider_name: overrides.provider.unwrap_or_else(|| "mock".to_string()),
            api_version: overrides
                .api_version
                .unwrap_or_else(|| HOST_API_VERSION.to_string()),
            fail_stop: overrides.fail_stop,
            stop_delay: Duration::from_millis(overrides.stop_delay_ms),
            state: Mutex::new(InstanceState::Running),
        }
    }

    fn info(&self, state: InstanceState) -> InstanceInfo {
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            instance_type: "t3.large".to_string(),
            region: "us-west-2".to_string(),
            zone: "us-west-2a".to_string(),
            provider: self.provider_name.clone(),
            state,
        }
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn api_version(&self) -> String {
        self.api_version.clone()
    }

    fn provider_name(&self) -> String {
        self.provider_name.clone()
    }

    fn provider_version(&self) -> String {
        "0.1.0".to_string()
    }

    async fn instance_info(&self) -> anyhow::Result<InstanceInfo> {
        let state = *self.state.lock().unwrap();
        Ok(self.info(state))
    }

    async fn stop_instance(&self) -> anyhow::Result<()> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        if self.fail_stop {
            anyhow::bail!("mock stop failure (fail_stop override set)");
        }
        *self.state.lock().unwrap() = InstanceState::Stopped;
        Ok(())
    }

    async fn start_instance(&self) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = InstanceState::Running;
        Ok(())
    }

    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceInfo>> {
        let state = *self.state.lock().unwrap();
        Ok(vec![self.info(state)])
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // No tracing subscriber here: stdout must carry exactly the
    // handshake line, and diagnostics belong to the parent's stderr pipe.
    snooze_plugins::serve::serve(MockProvider::from_env()).await?;
    Ok(())
}
