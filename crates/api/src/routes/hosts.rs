use std::sync::Arc;

use axum::extract::rejection::PathRejection;
use axum::extract::{Path, RawQuery, State};
use axum::Json;
use inventory_sqlite::{HostDetail, HostFilter, HostId, HostSummary};

use super::events::{EventView, EventsQuery};
use super::{blocking, QueryPairs};
use crate::error::ApiError;
use crate::state::AppState;

const HOST_EVENTS_PAGE: usize = 50;

fn host_id(path: Result<Path<HostId>, PathRejection>) -> Result<HostId, ApiError> {
    let Path(id) = path.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(id)
}

/// `GET /api/hosts?skip&limit&active_only`, most recently seen first.
pub async fn list_hosts(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<HostSummary>>, ApiError> {
    let q = QueryPairs::parse(raw.as_deref());
    let filter = HostFilter {
        skip: q.number("skip")?.unwrap_or(0),
        limit: q.number("limit")?.unwrap_or(0),
        active_only: q.flag("active_only")?.unwrap_or(false),
    };
    let hosts = blocking(&state, move |s| Ok(s.open_db()?.list_hosts(&filter)?)).await?;
    Ok(Json(hosts))
}

/// `GET /api/hosts/{id}` with active ports and their services.
pub async fn get_host(
    State(state): State<Arc<AppState>>,
    path: Result<Path<HostId>, PathRejection>,
) -> Result<Json<HostDetail>, ApiError> {
    let id = host_id(path)?;
    blocking(&state, move |s| s.open_db()?.host_detail(id)?.ok_or_else(|| ApiError::NotFound(format!("host {id}"))))
        .await
        .map(Json)
}

/// `GET /api/hosts/{id}/events`, newest first, 50 per page unless `limit` says otherwise.
pub async fn host_events(
    State(state): State<Arc<AppState>>,
    path: Result<Path<HostId>, PathRejection>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let id = host_id(path)?;
    let mut q = EventsQuery::from_raw(raw.as_deref())?;
    q.limit = q.limit.or(Some(HOST_EVENTS_PAGE));
    let mut filter = q.into_filter();
    filter.host_id = Some(id);
    let events = blocking(&state, move |s| {
        let db = s.open_db()?;
        if db.host_by_id(id)?.is_none() {
            return Err(ApiError::NotFound(format!("host {id}")));
        }
        Ok(db.list_events(&filter)?)
    })
    .await?;
    Ok(Json(events.into_iter().map(EventView::from).collect()))
}
