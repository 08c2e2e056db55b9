use inventory_sqlite::ResolveConflict;
use netinv_core::SnapshotError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Rejected before any mutation.
    #[error("malformed snapshot: {0}")]
    Invalid(#[from] SnapshotError),

    /// A natural-key race that re-reading could not settle.
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("fingerprint payload is not serializable: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<anyhow::Error> for ReconcileError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<ResolveConflict>() {
            Some(c) => ReconcileError::RetriesExhausted(c.to_string()),
            None => ReconcileError::Storage(e),
        }
    }
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(e: rusqlite::Error) -> Self {
        ReconcileError::Storage(e.into())
    }
}

impl ReconcileError {
    /// True when the caller sent a bad snapshot rather than the store failing.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ReconcileError::Invalid(_))
    }
}
