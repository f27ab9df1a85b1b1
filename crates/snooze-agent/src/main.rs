//! Agent daemon entry point.

use std::sync::Arc;

use anyhow::Result;
use snooze_agent::{Agent, AgentConfig, Server};
use snooze_plugins::{PluginRuntime, RuntimeConfig};
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

    let config = AgentConfig::from_env();
    let runtime = Arc::new(PluginRuntime::new(RuntimeConfig::from_env()));

    match runtime.discover() {
        Ok(plugins) => info!(?plugins, "discovered provider plugins"),
        Err(e) => info!(error = %e, "no plugins discovered yet"),
    }

    let agent = Arc::new(Agent::new(config.clone(), runtime));
    let server = Server::bind(&config.bind_addr, agent).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;
    Ok(())
}
