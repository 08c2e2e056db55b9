use crate::query::{host_by_address, host_by_id, port_by_id, port_by_key};
use crate::{Host, HostId, NewEvent, Port, PortId, Resolution, ServiceFields, ServiceId};
use anyhow::{anyhow, Result};
use rusqlite::ffi::{SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE};
use rusqlite::{params, Connection, ErrorCode};
use tracing::warn;
use uuid::Uuid;

/// Insert attempts before a uniqueness race is reported as a failure.
pub const MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// A natural key kept colliding on insert yet never became readable.
#[derive(Debug, thiserror::Error)]
#[error("{entity} {key}: identity still unresolved after {attempts} attempts")]
pub struct ResolveConflict {
    pub entity: &'static str,
    pub key: String,
    pub attempts: u32,
}

/// Only a key collision means another writer got there first. CHECK, NOT NULL,
/// foreign-key and trigger aborts are real failures.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::ConstraintViolation
                && matches!(f.extended_code, SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// Read-or-create loop shared by every natural-key resolver. A uniqueness
/// violation on insert means the row exists now, so the loop reads again.
fn resolve<T>(
    entity: &'static str,
    key: &str,
    mut read: impl FnMut() -> Result<Option<T>>,
    mut insert: impl FnMut() -> rusqlite::Result<i64>,
    mut read_created: impl FnMut(i64) -> Result<Option<T>>,
) -> Result<(T, Resolution)> {
    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        if let Some(found) = read()? {
            return Ok((found, Resolution::Existing));
        }
        match insert() {
            Ok(id) => {
                let created = read_created(id)?
                    .ok_or_else(|| anyhow!("{entity} {key}: row {id} vanished after insert"))?;
                return Ok((created, Resolution::Created));
            }
            Err(e) if is_unique_violation(&e) => {
                warn!(entity, key, attempt, error = %e, "insert conflicted, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ResolveConflict { entity, key: key.to_string(), attempts: MAX_RESOLVE_ATTEMPTS }.into())
}

/// Returns the host for `address`, creating it active with
/// `first_seen = last_seen = now` when absent.
pub fn resolve_host(conn: &Connection, address: &str, now_ms: i64) -> Result<(Host, Resolution)> {
    resolve(
        "host",
        address,
        || host_by_address(conn, address),
        || {
            conn.execute(
                "INSERT INTO hosts(address,first_seen_ms,last_seen_ms,active,created_ms,updated_ms) VALUES (?1,?2,?2,1,?2,?2)",
                params![address, now_ms],
            )?;
            Ok(conn.last_insert_rowid())
        },
        |id| host_by_id(conn, id),
    )
}

/// Returns the port keyed by `(host_id, port, protocol)`, creating it active
/// with the reported state when absent.
pub fn resolve_port(
    conn: &Connection,
    host_id: HostId,
    port: u16,
    protocol: &str,
    state: &str,
    now_ms: i64,
) -> Result<(Port, Resolution)> {
    let key = format!("{host_id}:{port}/{protocol}");
    resolve(
        "port",
        &key,
        || port_by_key(conn, host_id, port, protocol),
        || {
            conn.execute(
                "INSERT INTO ports(host_id,port,protocol,state,first_seen_ms,last_seen_ms,active) VALUES (?1,?2,?3,?4,?5,?5,1)",
                params![host_id, port, protocol, state, now_ms],
            )?;
            Ok(conn.last_insert_rowid())
        },
        |id| port_by_id(conn, id),
    )
}

/// Marks a host seen. `None` attributes leave the stored value untouched.
pub fn refresh_host(
    conn: &Connection,
    host_id: HostId,
    hostname: Option<&str>,
    mac_address: Option<&str>,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE hosts SET hostname=COALESCE(?2,hostname), mac_address=COALESCE(?3,mac_address), last_seen_ms=?4, active=1, updated_ms=?4 WHERE host_id=?1",
        params![host_id, hostname, mac_address, now_ms],
    )?;
    Ok(())
}

/// Marks a port present in the current snapshot.
pub fn touch_port(conn: &Connection, port_id: PortId, state: &str, now_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE ports SET active=1, state=?2, last_seen_ms=?3 WHERE port_id=?1",
        params![port_id, state, now_ms],
    )?;
    Ok(())
}

/// Marks a port absent from the current snapshot. `last_seen` keeps the time
/// it was last reported.
pub fn deactivate_port(conn: &Connection, port_id: PortId) -> Result<()> {
    conn.execute("UPDATE ports SET active=0 WHERE port_id=?1", [port_id])?;
    Ok(())
}

/// Writes the single service slot of a port, inserting or overwriting in place.
pub fn upsert_service(conn: &Connection, port_id: PortId, fields: &ServiceFields, now_ms: i64) -> Result<ServiceId> {
    conn.execute(
        "INSERT INTO services(port_id,service_name,service_version,banner,fingerprint_json,detected_ms) VALUES (?,?,?,?,?,?)
         ON CONFLICT(port_id) DO UPDATE SET service_name=excluded.service_name, service_version=excluded.service_version, banner=excluded.banner, fingerprint_json=excluded.fingerprint_json, detected_ms=excluded.detected_ms",
        params![port_id, fields.service_name, fields.service_version, fields.banner, fields.fingerprint_json, now_ms],
    )?;
    let id: ServiceId = conn.query_row(
        "SELECT service_id FROM services WHERE port_id=?",
        [port_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Appends events in slice order, all stamped `created_ms`.
pub fn append_events(conn: &Connection, scan_id: &Uuid, events: &[NewEvent], created_ms: i64) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO scan_events(scan_id,event_type,host_id,port_id,details_json,created_ms) VALUES (?,?,?,?,?,?)",
    )?;
    let scan_id = scan_id.to_string();
    for ev in events {
        let details = serde_json::to_string(&ev.details)?;
        stmt.execute(params![scan_id, ev.event_type.as_str(), ev.host_id, ev.port_id, details, created_ms])?;
    }
    Ok(events.len())
}
