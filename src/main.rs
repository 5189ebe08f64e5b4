use rabbitmq_provider::config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::load_config()?;

    let Some(client) = rabbitmq_provider::register(&config).await else {
        warn!("RabbitMQ provider is not available");
        return Ok(());
    };

    info!(
        "RabbitMQ provider ready, queues are prefixed with '{}'",
        client.naming().prefix()
    );

    // Keep the connection alive until interrupted
    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    client.shutdown().await;
    Ok(())
}
