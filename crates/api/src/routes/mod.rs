mod events;
mod hosts;
mod ports;
mod scan;
mod system;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::error::ApiError;
use crate::state::AppState;
use crate::MAX_BODY_BYTES;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(system::health))
        .route("/api/stats", get(system::stats))
        .route("/api/events", get(events::list_events))
        .route("/api/hosts", get(hosts::list_hosts))
        .route("/api/hosts/{id}", get(hosts::get_host))
        .route("/api/hosts/{id}/events", get(hosts::host_events))
        .route("/api/ports", get(ports::list_ports))
        .route("/api/ports/summary", get(ports::summary))
        .route("/api/scan/results", post(scan::submit_results))
        .route("/api/scan/trigger", post(scan::trigger))
        .route("/api/scan/status", get(scan::status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Runs store work off the async runtime.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> Result<T, ApiError> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
}

/// Decoded query string. Repeated keys are kept in order.
#[derive(Debug, Default)]
struct QueryPairs(Vec<(String, String)>);

impl QueryPairs {
    fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        QueryPairs(pairs)
    }

    /// Non-empty values of `key`.
    fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |(k, v)| k == key && !v.is_empty()).map(|(_, v)| v.as_str())
    }

    fn first<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.all(key).next()
    }

    fn number(&self, key: &str) -> Result<Option<usize>, ApiError> {
        self.first(key)
            .map(|v| v.parse::<usize>().map_err(|_| ApiError::BadRequest(format!("{key}: expected a non-negative integer, got {v:?}"))))
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ApiError> {
        self.first(key)
            .map(|v| match v {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ApiError::BadRequest(format!("{key}: expected true or false, got {v:?}"))),
            })
            .transpose()
    }
}
