use std::path::PathBuf;
use std::time::Duration;

use inventory_sqlite::{Db, DEFAULT_WRITE_WAIT};
use netinv_core::hostlock::HostLocks;
use netinv_core::ScanSnapshot;
use reconcile::{IngestSummary, ReconcileError, Reconciler};
use scanner_proxy::ScannerClient;

pub struct AppState {
    db_path: PathBuf,
    write_wait: Duration,
    reconciler: Reconciler,
    pub scanner: ScannerClient,
}

impl AppState {
    /// Creates or migrates the database up front so the first request does not pay for it.
    pub fn new(db_path: impl Into<PathBuf>, scanner: ScannerClient) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        Db::open_or_create(&db_path)?;
        Ok(AppState { db_path, write_wait: DEFAULT_WRITE_WAIT, reconciler: Reconciler::new(HostLocks::new()), scanner })
    }

    /// How long an ingestion waits for another writer before failing.
    pub fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// One connection per call. Blocking; run on a blocking worker.
    pub fn open_db(&self) -> anyhow::Result<Db> {
        let mut db = Db::open_or_create(&self.db_path)?;
        db.set_write_wait(self.write_wait);
        Ok(db)
    }

    /// Blocking; run on a blocking worker.
    pub fn ingest(&self, snapshot: &ScanSnapshot) -> Result<IngestSummary, ReconcileError> {
        let mut db = self.open_db()?;
        self.reconciler.ingest(&mut db, snapshot)
    }
}
