use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::Json;
use inventory_sqlite::{Port, PortFilter, PortSummary};

use super::{blocking, QueryPairs};
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/ports?skip&limit&active_only&host_id`. Only active ports unless `active_only=false`.
pub async fn list_ports(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Port>>, ApiError> {
    let q = QueryPairs::parse(raw.as_deref());
    let host_id = q
        .first("host_id")
        .map(|v| v.parse::<i64>().map_err(|_| ApiError::BadRequest(format!("host_id: expected an integer, got {v:?}"))))
        .transpose()?;
    let filter = PortFilter {
        skip: q.number("skip")?.unwrap_or(0),
        limit: q.number("limit")?.unwrap_or(0),
        active_only: q.flag("active_only")?.unwrap_or(true),
        host_id,
    };
    let ports = blocking(&state, move |s| Ok(s.open_db()?.list_ports(&filter)?)).await?;
    Ok(Json(ports))
}

/// `GET /api/ports/summary?active_only`: host count per port and protocol.
pub async fn summary(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<PortSummary>>, ApiError> {
    let active_only = QueryPairs::parse(raw.as_deref()).flag("active_only")?.unwrap_or(true);
    let rows = blocking(&state, move |s| Ok(s.open_db()?.port_summary(active_only)?)).await?;
    Ok(Json(rows))
}
