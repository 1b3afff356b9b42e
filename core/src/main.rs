/// MarketLink realtime client - Main entry point
use marketlink_core::{cli_app, ChatSession, Config};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, user_id, credential) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("🚀 Starting MarketLink client");
    info!("   User: {}", user_id);
    info!("   Endpoint: {}", config.redacted_url());

    let session = ChatSession::start(config, user_id, credential)
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;

    cli_app::run(session).await
}
