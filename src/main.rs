//! MoeNet DN42 Agent - Main Entry Point

use moenet_agent::config::AgentConfig;
use moenet_agent::Agent;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("MoeNet DN42 Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load()?;
    tracing::info!(
        node = %config.node_name,
        control_plane = %config.control_plane_url,
        api = %format!("{}:{}", config.api_host, config.api_port),
        "configuration loaded"
    );

    // Fatal startup errors (invalid identity, unbindable operator port)
    // exit non-zero so a supervisor can alert.
    let agent = Agent::init(config).await?;
    agent.run().await?;

    Ok(())
}
