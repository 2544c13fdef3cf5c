//! Roomfeed relay binary.

use roomfeed_relay::{AppState, RelayConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomfeed_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    if config.tokens.is_empty() {
        tracing::warn!("ROOMFEED_RELAY_TOKENS is empty; every connection will be rejected");
    }

    let state = AppState::new(&config);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!("Starting relay on {}", config.addr);

    roomfeed_relay::serve(listener, state).await?;
    Ok(())
}
