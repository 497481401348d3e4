//! Sharedraw relay server binary.

use sharedraw_server::{MemoryRoomStore, ServerConfig, ServerContext, app};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharedraw_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let addr = config.addr;
    let ctx = Arc::new(ServerContext::new(Arc::new(MemoryRoomStore::new()), config));

    info!("Sharedraw relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(ctx)).await?;
    Ok(())
}
