use crate::ReconcileError;
use inventory_sqlite::{service_for_port, upsert_service, PortId, ServiceFields};
use netinv_core::SnapshotPort;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Created,
    Updated,
    Unchanged,
    /// The port carried no service information; any stored slot is kept as is.
    NotReported,
}

fn present(v: Option<&String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty()).cloned()
}

/// Service slot content for a reported port. The fingerprint is stored as its
/// canonical JSON text, which is also what comparisons run against.
pub fn reported_fields(port: &SnapshotPort) -> Result<ServiceFields, serde_json::Error> {
    let fingerprint_json = match port.fingerprint_data.as_ref().filter(|v| !v.is_null()) {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };
    Ok(ServiceFields {
        service_name: present(port.service_name.as_ref()),
        service_version: present(port.service_version.as_ref()),
        banner: present(port.banner.as_ref()),
        fingerprint_json,
    })
}

/// Keeps the single service slot of `port_id` in line with the report.
/// Writes only when the slot is missing or one of its fields differs.
pub fn merge_service(
    conn: &Connection,
    port_id: PortId,
    reported: &SnapshotPort,
    now_ms: i64,
) -> Result<ServiceOutcome, ReconcileError> {
    if !reported.has_service() {
        return Ok(ServiceOutcome::NotReported);
    }
    let fields = reported_fields(reported)?;
    let outcome = match service_for_port(conn, port_id)? {
        None => ServiceOutcome::Created,
        Some(existing) if existing.fields() == fields => return Ok(ServiceOutcome::Unchanged),
        Some(_) => ServiceOutcome::Updated,
    };
    upsert_service(conn, port_id, &fields, now_ms)?;
    Ok(outcome)
}
