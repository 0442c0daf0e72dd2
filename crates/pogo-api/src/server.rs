use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::routes::create_router;
use crate::state::AppState;
use pogo_core::config::ServerConfig;
use pogo_core::{Dispatcher, Result};

/// Serve the front-end RPC surface until the process exits
pub async fn run(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let addr = SocketAddr::from((
        config
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| pogo_core::Error::Config(format!("Invalid host: {}", e)))?,
        config.port,
    ));

    let app = create_router(AppState::new(dispatcher));

    info!("pogo API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| pogo_core::Error::Config(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| pogo_core::Error::Internal(e.to_string()))?;

    Ok(())
}
