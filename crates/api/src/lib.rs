//! HTTP surface of the inventory: snapshot ingestion, scanner relay and the
//! read-only lookups dashboards use.

pub mod error;
mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use state::AppState;
use tracing::{info, warn};

/// Snapshots can be large; the axum default of 2 MiB is too small for a /16 sweep.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    routes::build_router(state)
}

/// Serves until Ctrl+C.
pub async fn start_server(listen: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("api server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
