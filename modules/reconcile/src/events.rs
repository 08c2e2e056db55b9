use inventory_sqlite::{append_events, EventType, Host, NewEvent, Port};
use rusqlite::Connection;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle events detected while applying one snapshot, in detection order.
///
/// Nothing reaches the store until [`EventLog::flush`], which runs inside the
/// snapshot transaction so events and the state they describe commit together.
pub struct EventLog {
    scan_id: Uuid,
    pending: Vec<NewEvent>,
}

impl EventLog {
    pub fn new(scan_id: Uuid) -> Self {
        EventLog { scan_id, pending: Vec::new() }
    }

    pub fn host_discovered(&mut self, host: &Host) {
        debug!(scan_id = %self.scan_id, ip = %host.address, "host discovered");
        self.pending.push(NewEvent {
            event_type: EventType::HostDiscovered,
            host_id: Some(host.host_id),
            port_id: None,
            details: json!({ "ip_address": host.address }),
        });
    }

    pub fn port_opened(&mut self, port: &Port) {
        debug!(scan_id = %self.scan_id, port = port.port, protocol = %port.protocol, "port opened");
        self.push_port(EventType::PortOpened, port);
    }

    pub fn port_closed(&mut self, port: &Port) {
        debug!(scan_id = %self.scan_id, port = port.port, protocol = %port.protocol, "port closed");
        self.push_port(EventType::PortClosed, port);
    }

    fn push_port(&mut self, event_type: EventType, port: &Port) {
        self.pending.push(NewEvent {
            event_type,
            host_id: Some(port.host_id),
            port_id: Some(port.port_id),
            details: json!({ "port_number": port.port, "protocol": port.protocol }),
        });
    }

    /// Writes every buffered event and returns how many were written.
    pub fn flush(self, conn: &Connection, created_ms: i64) -> anyhow::Result<usize> {
        append_events(conn, &self.scan_id, &self.pending, created_ms)
    }
}
