use admission::config::Config;
use admission::server::Server;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("admission={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting admission service");

    let policy = config
        .load_policy()
        .map_err(|e| anyhow::anyhow!("Failed to load admission policy: {}", e))?;
    tracing::info!(
        "Configuration: bind_addr={}, policy_file={:?}, enabled={}, categories={}",
        config.bind_addr,
        config.policy_file,
        policy.enabled,
        policy.categories.len()
    );

    // Create and run the server
    let server = Server::new(&config, &policy)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
