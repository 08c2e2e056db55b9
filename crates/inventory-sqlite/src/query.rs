use crate::{
    Db, EventFilter, EventType, Host, HostDetail, HostFilter, HostId, HostSummary, Port, PortDetail, PortFilter,
    PortId, PortSummary, ScanEvent, Service, Stats,
};
use anyhow::Result;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

pub const MAX_EVENT_PAGE: usize = 1000;
pub const DEFAULT_PAGE: usize = 100;

const HOST_COLS: &str = "host_id,address,hostname,mac_address,first_seen_ms,last_seen_ms,active";
const PORT_COLS: &str = "port_id,host_id,port,protocol,state,first_seen_ms,last_seen_ms,active";
const SERVICE_COLS: &str = "service_id,port_id,service_name,service_version,banner,fingerprint_json,detected_ms";
const EVENT_COLS: &str = "event_id,scan_id,event_type,host_id,port_id,details_json,created_ms";

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let cnt: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
        [name],
        |r| r.get(0),
    )?;
    Ok(cnt > 0)
}

fn host_from_row(r: &Row) -> rusqlite::Result<Host> {
    Ok(Host {
        host_id: r.get(0)?,
        address: r.get(1)?,
        hostname: r.get(2)?,
        mac_address: r.get(3)?,
        first_seen_ms: r.get(4)?,
        last_seen_ms: r.get(5)?,
        active: r.get(6)?,
    })
}

fn port_from_row(r: &Row) -> rusqlite::Result<Port> {
    Ok(Port {
        port_id: r.get(0)?,
        host_id: r.get(1)?,
        port: r.get(2)?,
        protocol: r.get(3)?,
        state: r.get(4)?,
        first_seen_ms: r.get(5)?,
        last_seen_ms: r.get(6)?,
        active: r.get(7)?,
    })
}

fn service_from_row(r: &Row) -> rusqlite::Result<Service> {
    Ok(Service {
        service_id: r.get(0)?,
        port_id: r.get(1)?,
        service_name: r.get(2)?,
        service_version: r.get(3)?,
        banner: r.get(4)?,
        fingerprint_json: r.get(5)?,
        detected_ms: r.get(6)?,
    })
}

fn event_from_row(r: &Row) -> rusqlite::Result<ScanEvent> {
    let kind: String = r.get(2)?;
    let event_type = kind
        .parse::<EventType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let details: Option<String> = r.get(5)?;
    let details = match details {
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        None => serde_json::Value::Null,
    };
    Ok(ScanEvent {
        event_id: r.get(0)?,
        scan_id: r.get(1)?,
        event_type,
        host_id: r.get(3)?,
        port_id: r.get(4)?,
        details,
        created_ms: r.get(6)?,
    })
}

pub fn host_by_address(conn: &Connection, address: &str) -> Result<Option<Host>> {
    let sql = format!("SELECT {HOST_COLS} FROM hosts WHERE address=?");
    Ok(conn.query_row(&sql, [address], host_from_row).optional()?)
}

pub fn host_by_id(conn: &Connection, host_id: HostId) -> Result<Option<Host>> {
    let sql = format!("SELECT {HOST_COLS} FROM hosts WHERE host_id=?");
    Ok(conn.query_row(&sql, [host_id], host_from_row).optional()?)
}

pub fn port_by_key(conn: &Connection, host_id: HostId, port: u16, protocol: &str) -> Result<Option<Port>> {
    let sql = format!("SELECT {PORT_COLS} FROM ports WHERE host_id=? AND port=? AND protocol=?");
    Ok(conn.query_row(&sql, params![host_id, port, protocol], port_from_row).optional()?)
}

pub fn port_by_id(conn: &Connection, port_id: PortId) -> Result<Option<Port>> {
    let sql = format!("SELECT {PORT_COLS} FROM ports WHERE port_id=?");
    Ok(conn.query_row(&sql, [port_id], port_from_row).optional()?)
}

/// All ports of a host, ordered by protocol then number.
pub fn ports_for_host(conn: &Connection, host_id: HostId) -> Result<Vec<Port>> {
    let sql = format!("SELECT {PORT_COLS} FROM ports WHERE host_id=? ORDER BY protocol, port");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([host_id], port_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn active_ports_for_host(conn: &Connection, host_id: HostId) -> Result<Vec<Port>> {
    let sql = format!("SELECT {PORT_COLS} FROM ports WHERE host_id=? AND active=1 ORDER BY protocol, port");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([host_id], port_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn service_for_port(conn: &Connection, port_id: PortId) -> Result<Option<Service>> {
    let sql = format!("SELECT {SERVICE_COLS} FROM services WHERE port_id=?");
    Ok(conn.query_row(&sql, [port_id], service_from_row).optional()?)
}

/// Newest first. A zero limit means the default page of 100.
pub fn list_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<ScanEvent>> {
    let mut sql = format!("SELECT {EVENT_COLS} FROM scan_events");
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();
    if !filter.event_types.is_empty() {
        let marks = vec!["?"; filter.event_types.len()].join(",");
        clauses.push(format!("event_type IN ({marks})"));
        for t in &filter.event_types {
            args.push(Box::new(t.as_str()));
        }
    }
    if let Some(scan_id) = filter.scan_id {
        clauses.push("scan_id=?".into());
        args.push(Box::new(scan_id.to_string()));
    }
    if let Some(host_id) = filter.host_id {
        clauses.push("host_id=?".into());
        args.push(Box::new(host_id));
    }
    push_where(&mut sql, &clauses);
    sql.push_str(" ORDER BY created_ms DESC, event_id DESC LIMIT ? OFFSET ?");
    args.push(Box::new(page(filter.limit)));
    args.push(Box::new(filter.skip as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn push_where(sql: &mut String, clauses: &[String]) {
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

fn page(limit: usize) -> i64 {
    match limit {
        0 => DEFAULT_PAGE as i64,
        n => n.min(MAX_EVENT_PAGE) as i64,
    }
}

/// Most recently seen first, each with its active port count and newest note.
pub fn list_hosts(conn: &Connection, filter: &HostFilter) -> Result<Vec<HostSummary>> {
    let mut sql = format!(
        "SELECT {HOST_COLS}, \
           (SELECT COUNT(1) FROM ports p WHERE p.host_id=hosts.host_id AND p.active=1), \
           (SELECT note FROM annotations a WHERE a.host_id=hosts.host_id \
              ORDER BY a.created_ms DESC, a.annotation_id DESC LIMIT 1) \
         FROM hosts"
    );
    if filter.active_only {
        sql.push_str(" WHERE active=1");
    }
    sql.push_str(" ORDER BY last_seen_ms DESC, host_id DESC LIMIT ? OFFSET ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![page(filter.limit), filter.skip as i64], |r| {
        Ok(HostSummary { host: host_from_row(r)?, port_count: r.get(7)?, latest_annotation: r.get(8)? })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// A host with its active ports and their service slots, or `None` if unknown.
pub fn host_detail(conn: &Connection, host_id: HostId) -> Result<Option<HostDetail>> {
    let Some(host) = host_by_id(conn, host_id)? else {
        return Ok(None);
    };
    let ports = active_ports_for_host(conn, host_id)?
        .into_iter()
        .map(|port| {
            let service = service_for_port(conn, port.port_id)?;
            Ok(PortDetail { port, service })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(HostDetail { host, port_count: ports.len(), ports }))
}

/// Ordered by port number, then protocol and row id.
pub fn list_ports(conn: &Connection, filter: &PortFilter) -> Result<Vec<Port>> {
    let mut sql = format!("SELECT {PORT_COLS} FROM ports");
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();
    if filter.active_only {
        clauses.push("active=1".into());
    }
    if let Some(host_id) = filter.host_id {
        clauses.push("host_id=?".into());
        args.push(Box::new(host_id));
    }
    push_where(&mut sql, &clauses);
    sql.push_str(" ORDER BY port, protocol, port_id LIMIT ? OFFSET ?");
    args.push(Box::new(page(filter.limit)));
    args.push(Box::new(filter.skip as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), port_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// How many hosts expose each (port, protocol).
pub fn port_summary(conn: &Connection, active_only: bool) -> Result<Vec<PortSummary>> {
    let filter = if active_only { " WHERE active=1" } else { "" };
    let sql = format!(
        "SELECT port, protocol, COUNT(DISTINCT host_id) FROM ports{filter} GROUP BY port, protocol ORDER BY port, protocol"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |r| Ok(PortSummary { port: r.get(0)?, protocol: r.get(1)?, host_count: r.get(2)? }))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every event of one snapshot, in the order it was emitted.
pub fn events_for_scan(conn: &Connection, scan_id: &Uuid) -> Result<Vec<ScanEvent>> {
    let sql = format!("SELECT {EVENT_COLS} FROM scan_events WHERE scan_id=? ORDER BY event_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([scan_id.to_string()], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Dashboard counts. Events at or after `recent_since_ms` count as recent.
pub fn stats(conn: &Connection, recent_since_ms: i64) -> Result<Stats> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Stats {
        total_hosts: count("SELECT COUNT(1) FROM hosts")?,
        active_hosts: count("SELECT COUNT(1) FROM hosts WHERE active=1")?,
        total_ports: count("SELECT COUNT(1) FROM ports")?,
        active_ports: count("SELECT COUNT(1) FROM ports WHERE active=1")?,
        recent_events_count: conn.query_row(
            "SELECT COUNT(1) FROM scan_events WHERE created_ms >= ?",
            [recent_since_ms],
            |r| r.get(0),
        )?,
    })
}

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.conn, name)
    }

    pub fn host_by_address(&self, address: &str) -> Result<Option<Host>> {
        host_by_address(&self.conn, address)
    }

    pub fn ports_for_host(&self, host_id: HostId) -> Result<Vec<Port>> {
        ports_for_host(&self.conn, host_id)
    }

    pub fn list_events(&self, filter: &EventFilter) -> Result<Vec<ScanEvent>> {
        list_events(&self.conn, filter)
    }

    pub fn host_by_id(&self, host_id: HostId) -> Result<Option<Host>> {
        host_by_id(&self.conn, host_id)
    }

    pub fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<HostSummary>> {
        list_hosts(&self.conn, filter)
    }

    pub fn host_detail(&self, host_id: HostId) -> Result<Option<HostDetail>> {
        host_detail(&self.conn, host_id)
    }

    pub fn list_ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        list_ports(&self.conn, filter)
    }

    pub fn port_summary(&self, active_only: bool) -> Result<Vec<PortSummary>> {
        port_summary(&self.conn, active_only)
    }

    pub fn events_for_scan(&self, scan_id: &Uuid) -> Result<Vec<ScanEvent>> {
        events_for_scan(&self.conn, scan_id)
    }

    pub fn stats(&self, recent_since_ms: i64) -> Result<Stats> {
        stats(&self.conn, recent_since_ms)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        anyhow::ensure!(
            matches!(table, "hosts" | "ports" | "services" | "scan_events" | "annotations"),
            "unsupported table: {table}"
        );
        let sql = format!("SELECT COUNT(1) FROM {table}");
        Ok(self.conn.query_row(&sql, [], |r| r.get(0))?)
    }
}
