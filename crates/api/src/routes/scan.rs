use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use netinv_core::ScanSnapshot;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::blocking;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub scan_id: Uuid,
    pub hosts_processed: usize,
    pub ports_processed: usize,
    pub events_created: usize,
}

/// `POST /api/scan/results`. Malformed bodies are a 400, whatever the reason.
pub async fn submit_results(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ScanSnapshot>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(snapshot) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    info!(scan_id = %snapshot.scan_id, hosts = snapshot.hosts.len(), ports = snapshot.port_count(), "snapshot received");
    let summary = blocking(&state, move |s| Ok(s.ingest(&snapshot)?)).await?;
    Ok(Json(IngestResponse {
        status: "success",
        scan_id: summary.scan_id,
        hosts_processed: summary.hosts_processed,
        ports_processed: summary.ports_processed,
        events_created: summary.events_created,
    }))
}

pub async fn trigger(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.scanner.trigger().await?))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.scanner.status().await?))
}
