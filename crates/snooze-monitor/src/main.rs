//! Monitor daemon entry point.

use anyhow::{Context, Result};
use snooze_monitor::{InstanceIdentity, Monitor, MonitorConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::var("SNOOZE_MONITOR_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            MonitorConfig::from_toml(&raw).with_context(|| format!("parsing {}", path))?
        }
        Err(_) => MonitorConfig::new(InstanceIdentity::from_env()),
    };

    info!(
        instance = %config.instance.instance_id,
        agent = %config.agent_endpoint,
        "starting monitor"
    );

    let monitor = Monitor::new(config);
    monitor.on_error(|e| tracing::warn!(error = %e, "monitor error"));

    let cancel = CancellationToken::new();
    monitor.start(cancel.clone())?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping monitor");
    monitor.stop().await?;
    Ok(())
}
