use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::Json;
use inventory_sqlite::{format_ms, EventFilter, EventType, ScanEvent};
use serde::Serialize;

use super::{blocking, QueryPairs};
use crate::error::ApiError;
use crate::state::AppState;

/// `?skip&limit&event_type`, plus repeated `event_types` which win over `event_type`.
#[derive(Debug, Default)]
pub struct EventsQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub event_types: Vec<EventType>,
}

impl EventsQuery {
    pub(crate) fn from_raw(raw: Option<&str>) -> Result<Self, ApiError> {
        let q = QueryPairs::parse(raw);
        let mut names: Vec<&str> = q.all("event_types").collect();
        if names.is_empty() {
            names.extend(q.first("event_type"));
        }
        let event_types = names
            .into_iter()
            .map(|t| t.parse::<EventType>().map_err(|e| ApiError::BadRequest(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EventsQuery { skip: q.number("skip")?, limit: q.number("limit")?, event_types })
    }

    pub(crate) fn into_filter(self) -> EventFilter {
        EventFilter {
            skip: self.skip.unwrap_or(0),
            limit: self.limit.unwrap_or(0),
            event_types: self.event_types,
            scan_id: None,
            host_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub event_id: i64,
    pub scan_id: String,
    pub event_type: EventType,
    pub host_id: Option<i64>,
    pub port_id: Option<i64>,
    pub details: serde_json::Value,
    pub created_at: String,
}

impl From<ScanEvent> for EventView {
    fn from(e: ScanEvent) -> Self {
        EventView {
            event_id: e.event_id,
            scan_id: e.scan_id,
            event_type: e.event_type,
            host_id: e.host_id,
            port_id: e.port_id,
            details: e.details,
            created_at: format_ms(e.created_ms),
        }
    }
}

/// `GET /api/events`, newest first.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let filter = EventsQuery::from_raw(raw.as_deref())?.into_filter();
    let events = blocking(&state, move |s| Ok(s.open_db()?.list_events(&filter)?)).await?;
    Ok(Json(events.into_iter().map(EventView::from).collect()))
}
