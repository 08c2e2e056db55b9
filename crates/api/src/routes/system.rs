use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use inventory_sqlite::{now_ms, Stats};
use serde_json::{json, Value};

use super::blocking;
use crate::error::ApiError;
use crate::state::AppState;

const RECENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Stats>, ApiError> {
    let since = now_ms() - RECENT_WINDOW_MS;
    let stats = blocking(&state, move |s| Ok(s.open_db()?.stats(since)?)).await?;
    Ok(Json(stats))
}
