use crate::query::table_exists;
use crate::schema::MIG_0001_INIT;
use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const BUSY_PAUSE: Duration = Duration::from_millis(25);

/// How long [`Db::snapshot_tx`] keeps waiting for the write lock.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(600);

pub struct Db {
    pub conn: Connection,
    write_wait: Duration,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open inventory database {}", path.display()))?;
        apply_pragmas(&conn, true)?;
        migrate(&conn)?;
        debug!(path = %path.display(), "inventory database opened");
        Ok(Db { conn, write_wait: DEFAULT_WRITE_WAIT })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, false)?;
        migrate(&conn)?;
        Ok(Db { conn, write_wait: DEFAULT_WRITE_WAIT })
    }

    /// Per-attempt wait inside SQLite before a locked database reports busy.
    pub fn set_busy_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn set_write_wait(&mut self, wait: Duration) {
        self.write_wait = wait;
    }

    /// Opens the write transaction a whole snapshot is applied in.
    ///
    /// `IMMEDIATE` takes the database write lock up front, so the reads made
    /// during reconciliation cannot go stale before the commit. While another
    /// connection holds the lock this keeps retrying, for up to the write wait.
    pub fn snapshot_tx(&mut self) -> Result<Transaction<'_>> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate) {
                Ok(tx) => return Ok(tx),
                Err(e) if is_busy(&e) && started.elapsed() < self.write_wait => {
                    warn!(attempt, waited_ms = started.elapsed().as_millis() as u64, "database busy, waiting for the write lock");
                    std::thread::sleep(BUSY_PAUSE);
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("write lock not acquired after {} ms", started.elapsed().as_millis())))
                }
            }
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<()> {
    if on_disk {
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", &"WAL", |r| r.get(0))?;
        debug!(journal_mode = %mode, "journal mode set");
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", &"ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    // naive: if hosts table doesn't exist, apply 0001
    if !table_exists(conn, "hosts")? {
        conn.execute_batch(MIG_0001_INIT)?;
    }
    Ok(())
}
