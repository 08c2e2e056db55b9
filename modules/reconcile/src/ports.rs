//! Port state machine for one host.
//!
//! ```text
//! unknown --reported--> active --absent--> inactive --reported--> active
//! ```
//!
//! The prior active set is captured when the pass begins, before any reported
//! port is applied. The sweep closes `prior_active - reported` and only runs
//! after every reported port has been applied.

use anyhow::Result;
use inventory_sqlite::{active_ports_for_host, deactivate_port, resolve_port, touch_port, HostId, Port, Resolution};
use netinv_core::{PortKey, SnapshotPort};
use rusqlite::Connection;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTransition {
    /// First sighting of this key.
    Opened,
    /// Known but inactive; active again.
    Reopened,
    /// Already active; timestamps and state refreshed.
    Refreshed,
}

impl PortTransition {
    pub fn emits_open(self) -> bool {
        matches!(self, PortTransition::Opened | PortTransition::Reopened)
    }
}

pub struct PortPass<'c> {
    conn: &'c Connection,
    host_id: HostId,
    prior_active: Vec<Port>,
    reported: HashSet<PortKey>,
}

impl<'c> PortPass<'c> {
    pub fn begin(conn: &'c Connection, host_id: HostId) -> Result<Self> {
        let prior_active = active_ports_for_host(conn, host_id)?;
        Ok(PortPass { conn, host_id, prior_active, reported: HashSet::new() })
    }

    pub fn prior_active(&self) -> &[Port] {
        &self.prior_active
    }

    /// Applies one reported port. The port must have passed snapshot validation.
    pub fn apply(&mut self, reported: &SnapshotPort, now_ms: i64) -> Result<(Port, PortTransition)> {
        let key = reported
            .key()
            .ok_or_else(|| anyhow::anyhow!("port number {} out of range", reported.port_number))?;
        let state = reported.state.trim();
        let (mut port, resolution) = resolve_port(self.conn, self.host_id, key.number, &key.protocol, state, now_ms)?;
        self.reported.insert(key);

        let transition = match resolution {
            Resolution::Created => PortTransition::Opened,
            Resolution::Existing => {
                let was_active = port.active;
                touch_port(self.conn, port.port_id, state, now_ms)?;
                port.active = true;
                port.state = state.to_string();
                port.last_seen_ms = now_ms;
                if was_active { PortTransition::Refreshed } else { PortTransition::Reopened }
            }
        };
        Ok((port, transition))
    }

    /// Deactivates every previously active port that was not reported.
    /// Returns the ports closed, in (protocol, number) order.
    pub fn sweep(self) -> Result<Vec<Port>> {
        let mut closed = Vec::new();
        for mut port in self.prior_active {
            let key = PortKey { number: port.port, protocol: port.protocol.clone() };
            if self.reported.contains(&key) {
                continue;
            }
            deactivate_port(self.conn, port.port_id)?;
            port.active = false;
            closed.push(port);
        }
        Ok(closed)
    }
}
