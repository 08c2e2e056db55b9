//! Scan-snapshot reconciliation.
//!
//! One snapshot is merged into the persistent host/port/service state inside a
//! single write transaction. The transitions detected along the way (host
//! discovered, port opened or reopened, port closed) are appended to the event
//! log in the same transaction, so either the whole snapshot lands or none of it.

mod error;
mod events;
mod ports;
mod service;

pub use error::ReconcileError;
pub use events::EventLog;
pub use ports::{PortPass, PortTransition};
pub use service::{merge_service, reported_fields, ServiceOutcome};

use inventory_sqlite::{host_by_id, now_ms, refresh_host, resolve_host, Db, Host};
use netinv_core::hostlock::HostLocks;
use netinv_core::{non_empty, ScanSnapshot, SnapshotHost};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub scan_id: Uuid,
    pub hosts_processed: usize,
    pub ports_processed: usize,
    pub events_created: usize,
    pub hosts_discovered: usize,
    pub ports_opened: usize,
    pub ports_closed: usize,
    pub services_written: usize,
}

/// Result of merging one host entry.
#[derive(Debug, Clone)]
pub struct MergedHost {
    pub host: Host,
    pub discovered: bool,
}

/// Upserts a host by address. Empty hostname/MAC values never erase stored ones.
/// `discovered` is true only when this call created the record.
pub fn merge_host(conn: &Connection, entry: &SnapshotHost, now_ms: i64) -> anyhow::Result<MergedHost> {
    let address = entry.address();
    let (host, resolution) = resolve_host(conn, &address, now_ms)?;
    refresh_host(
        conn,
        host.host_id,
        non_empty(entry.hostname.as_deref()),
        non_empty(entry.mac_address.as_deref()),
        now_ms,
    )?;
    let host = host_by_id(conn, host.host_id)?.unwrap_or(host);
    Ok(MergedHost { host, discovered: resolution.is_created() })
}

/// Host entries grouped by canonical address, in order of first appearance.
/// A host listed twice in one snapshot is reconciled once against the union of
/// its port lists, so a port can never be both opened and closed by one snapshot.
fn group_by_address(hosts: &[SnapshotHost]) -> Vec<(String, Vec<&SnapshotHost>)> {
    let mut groups: Vec<(String, Vec<&SnapshotHost>)> = Vec::new();
    for h in hosts {
        let addr = h.address();
        match groups.iter_mut().find(|(a, _)| *a == addr) {
            Some((_, entries)) => entries.push(h),
            None => groups.push((addr, vec![h])),
        }
    }
    groups
}

/// Reconciles one host's entries: host merge, per-port pass, service merge, sweep.
fn reconcile_host(
    conn: &Connection,
    entries: &[&SnapshotHost],
    now_ms: i64,
    log: &mut EventLog,
    summary: &mut IngestSummary,
) -> Result<(), ReconcileError> {
    let mut merged: Option<MergedHost> = None;
    for entry in entries {
        let m = merge_host(conn, entry, now_ms)?;
        if m.discovered {
            log.host_discovered(&m.host);
            summary.hosts_discovered += 1;
        }
        merged = Some(m);
    }
    let Some(merged) = merged else { return Ok(()); };
    let host_id = merged.host.host_id;

    let mut pass = PortPass::begin(conn, host_id)?;
    for entry in entries {
        for reported in &entry.ports {
            let (port, transition) = pass.apply(reported, now_ms)?;
            if transition.emits_open() {
                log.port_opened(&port);
                summary.ports_opened += 1;
            }
            match merge_service(conn, port.port_id, reported, now_ms)? {
                ServiceOutcome::Created | ServiceOutcome::Updated => summary.services_written += 1,
                ServiceOutcome::Unchanged | ServiceOutcome::NotReported => {}
            }
            summary.ports_processed += 1;
        }
    }
    for port in pass.sweep()? {
        log.port_closed(&port);
        summary.ports_closed += 1;
    }
    debug!(ip = %merged.host.address, host_id, "host reconciled");
    Ok(())
}

/// Applies scan snapshots to the inventory.
pub struct Reconciler {
    locks: HostLocks,
}

impl Default for Reconciler {
    fn default() -> Self {
        Reconciler::new(HostLocks::new())
    }
}

impl Reconciler {
    /// Reconcilers sharing one `HostLocks` never interleave on the same host.
    pub fn new(locks: HostLocks) -> Self {
        Reconciler { locks }
    }

    pub fn locks(&self) -> &HostLocks {
        &self.locks
    }

    /// Applies one snapshot. Blocks while another snapshot holds any of this
    /// snapshot's hosts; call it from a blocking worker, not from inside an
    /// async task.
    pub fn ingest(&self, db: &mut Db, snapshot: &ScanSnapshot) -> Result<IngestSummary, ReconcileError> {
        self.apply(db, snapshot, now_ms)
    }

    /// Same as [`Reconciler::ingest`] with a fixed clock. Every timestamp
    /// written for the snapshot is `now_ms`.
    pub fn ingest_at(&self, db: &mut Db, snapshot: &ScanSnapshot, now_ms: i64) -> Result<IngestSummary, ReconcileError> {
        self.apply(db, snapshot, || now_ms)
    }

    fn apply(
        &self,
        db: &mut Db,
        snapshot: &ScanSnapshot,
        clock: impl FnOnce() -> i64,
    ) -> Result<IngestSummary, ReconcileError> {
        snapshot.validate()?;

        let guards = self.locks.acquire_blocking(snapshot.host_addresses());
        debug!(scan_id = %snapshot.scan_id, hosts = guards.keys.len(), tracked = self.locks.tracked(), "host locks held");
        let tx = db.snapshot_tx()?;
        // Read after the locks so timestamps follow commit order per host
        let now_ms = clock();

        let mut log = EventLog::new(snapshot.scan_id);
        let mut summary = IngestSummary { scan_id: snapshot.scan_id, ..Default::default() };
        for (_, entries) in group_by_address(&snapshot.hosts) {
            reconcile_host(&tx, &entries, now_ms, &mut log, &mut summary)?;
            summary.hosts_processed += entries.len();
        }
        summary.events_created = log.flush(&tx, now_ms)?;
        tx.commit()?;

        info!(
            scan_id = %summary.scan_id,
            hosts = summary.hosts_processed,
            ports = summary.ports_processed,
            events = summary.events_created,
            discovered = summary.hosts_discovered,
            opened = summary.ports_opened,
            closed = summary.ports_closed,
            "snapshot reconciled"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_sqlite::{events_for_scan, service_for_port, EventType, Port};
    use netinv_core::SnapshotPort;
    use serde_json::json;

    fn tcp(n: i64) -> SnapshotPort {
        SnapshotPort {
            port_number: n,
            protocol: "tcp".into(),
            state: "open".into(),
            service_name: None,
            service_version: None,
            banner: None,
            fingerprint_data: None,
        }
    }

    fn host(ip: &str, ports: Vec<SnapshotPort>) -> SnapshotHost {
        SnapshotHost { ip_address: ip.into(), hostname: None, mac_address: None, ports }
    }

    fn snapshot(hosts: Vec<SnapshotHost>) -> ScanSnapshot {
        ScanSnapshot { scan_id: Uuid::new_v4(), hosts }
    }

    fn kinds(db: &Db, s: &ScanSnapshot) -> Vec<(EventType, serde_json::Value)> {
        events_for_scan(&db.conn, &s.scan_id).unwrap().into_iter().map(|e| (e.event_type, e.details)).collect()
    }

    fn ports_of(db: &Db, ip: &str) -> Vec<Port> {
        let h = db.host_by_address(ip).unwrap().unwrap();
        db.ports_for_host(h.host_id).unwrap()
    }

    #[test]
    fn first_snapshot_discovers_and_opens() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let s = snapshot(vec![host("10.0.0.1", vec![tcp(22), tcp(80)])]);
        let sum = r.ingest_at(&mut db, &s, 1_000).unwrap();
        assert_eq!((sum.hosts_processed, sum.ports_processed, sum.events_created), (1, 2, 3));
        assert_eq!(
            kinds(&db, &s),
            vec![
                (EventType::HostDiscovered, json!({"ip_address": "10.0.0.1"})),
                (EventType::PortOpened, json!({"port_number": 22, "protocol": "tcp"})),
                (EventType::PortOpened, json!({"port_number": 80, "protocol": "tcp"})),
            ]
        );
    }

    #[test]
    fn identical_replay_is_idempotent() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let mut p = tcp(443);
        p.service_name = Some("https".into());
        p.banner = Some("nginx".into());
        let mut s = snapshot(vec![host("10.0.0.1", vec![tcp(22), p])]);
        r.ingest_at(&mut db, &s, 1_000).unwrap();
        let before = ports_of(&db, "10.0.0.1");
        let svc_before = service_for_port(&db.conn, before[1].port_id).unwrap().unwrap();

        s.scan_id = Uuid::new_v4();
        let sum = r.ingest_at(&mut db, &s, 2_000).unwrap();
        assert_eq!(sum.events_created, 0);
        assert!(kinds(&db, &s).is_empty());

        let after = ports_of(&db, "10.0.0.1");
        assert_eq!(after.len(), before.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!((a.port_id, a.active, &a.state, a.first_seen_ms), (b.port_id, b.active, &b.state, b.first_seen_ms));
            assert_eq!(a.last_seen_ms, 2_000);
        }
        // Identical service content: no rewrite at all
        assert_eq!(service_for_port(&db.conn, after[1].port_id).unwrap().unwrap(), svc_before);
        assert_eq!(db.count_rows("hosts").unwrap(), 1);
    }

    #[test]
    fn set_difference_closes_and_opens_exactly_once() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(80), tcp(22), tcp(443)])]), 1_000).unwrap();

        let s = snapshot(vec![host("10.0.0.1", vec![tcp(22), tcp(443), tcp(8080)])]);
        r.ingest_at(&mut db, &s, 2_000).unwrap();
        let mut ev = kinds(&db, &s);
        ev.sort_by_key(|(t, _)| t.as_str());
        assert_eq!(
            ev,
            vec![
                (EventType::PortClosed, json!({"port_number": 80, "protocol": "tcp"})),
                (EventType::PortOpened, json!({"port_number": 8080, "protocol": "tcp"})),
            ]
        );
        for p in ports_of(&db, "10.0.0.1") {
            match p.port {
                80 => assert!(!p.active && p.last_seen_ms == 1_000),
                22 | 443 => assert!(p.active && p.last_seen_ms == 2_000 && p.first_seen_ms == 1_000),
                8080 => assert!(p.active && p.first_seen_ms == 2_000),
                other => panic!("unexpected port {other}"),
            }
        }
    }

    #[test]
    fn closed_port_reopens_with_one_event() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(22), tcp(3389)])]), 1).unwrap();
        let close = snapshot(vec![host("10.0.0.1", vec![tcp(22)])]);
        r.ingest_at(&mut db, &close, 2).unwrap();
        assert_eq!(kinds(&db, &close).len(), 1);

        let reopen = snapshot(vec![host("10.0.0.1", vec![tcp(22), tcp(3389)])]);
        r.ingest_at(&mut db, &reopen, 3).unwrap();
        assert_eq!(kinds(&db, &reopen), vec![(EventType::PortOpened, json!({"port_number": 3389, "protocol": "tcp"}))]);
        let rdp: Vec<Port> = ports_of(&db, "10.0.0.1").into_iter().filter(|p| p.port == 3389).collect();
        assert_eq!(rdp.len(), 1);
        assert!(rdp[0].active);
        assert_eq!(rdp[0].first_seen_ms, 1);
    }

    #[test]
    fn discovery_is_exactly_once_even_with_equal_clocks() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let first = snapshot(vec![host("192.168.1.50", vec![])]);
        let second = snapshot(vec![host("192.168.1.50", vec![])]);
        r.ingest_at(&mut db, &first, 5_000).unwrap();
        r.ingest_at(&mut db, &second, 5_000).unwrap();
        assert_eq!(kinds(&db, &first).len(), 1);
        assert!(kinds(&db, &second).is_empty());
    }

    #[test]
    fn empty_attributes_do_not_erase() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let mut h = host("10.0.0.1", vec![]);
        h.hostname = Some("printer.lan".into());
        h.mac_address = Some("00:11:22:33:44:55".into());
        r.ingest_at(&mut db, &snapshot(vec![h]), 1).unwrap();

        let mut h = host("10.0.0.1", vec![]);
        h.hostname = Some("".into());
        r.ingest_at(&mut db, &snapshot(vec![h]), 2).unwrap();
        let stored = db.host_by_address("10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.hostname.as_deref(), Some("printer.lan"));
        assert_eq!(stored.mac_address.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!((stored.first_seen_ms, stored.last_seen_ms), (1, 2));

        let mut h = host("10.0.0.1", vec![]);
        h.hostname = Some("printer-2.lan".into());
        r.ingest_at(&mut db, &snapshot(vec![h]), 3).unwrap();
        assert_eq!(db.host_by_address("10.0.0.1").unwrap().unwrap().hostname.as_deref(), Some("printer-2.lan"));
    }

    #[test]
    fn banner_change_overwrites_service_in_place() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let mut p = tcp(22);
        p.service_name = Some("ssh".into());
        p.banner = Some("SSH-2.0-OpenSSH_8.9".into());
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![p.clone()])]), 1).unwrap();
        let port_id = ports_of(&db, "10.0.0.1")[0].port_id;
        let first = service_for_port(&db.conn, port_id).unwrap().unwrap();

        p.banner = Some("SSH-2.0-OpenSSH_9.6".into());
        let s = snapshot(vec![host("10.0.0.1", vec![p])]);
        let sum = r.ingest_at(&mut db, &s, 2).unwrap();
        assert_eq!(sum.services_written, 1);
        assert_eq!(sum.events_created, 0);
        let second = service_for_port(&db.conn, port_id).unwrap().unwrap();
        assert_eq!(second.service_id, first.service_id);
        assert_eq!(second.banner.as_deref(), Some("SSH-2.0-OpenSSH_9.6"));
        assert_eq!(second.detected_ms, 2);
        assert_eq!(db.count_rows("services").unwrap(), 1);
    }

    #[test]
    fn service_survives_a_report_without_service_info() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let mut p = tcp(25);
        p.service_name = Some("smtp".into());
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![p])]), 1).unwrap();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(25)])]), 2).unwrap();
        // Even a closed port keeps its service slot
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![])]), 3).unwrap();
        let port = &ports_of(&db, "10.0.0.1")[0];
        assert!(!port.active);
        let svc = service_for_port(&db.conn, port.port_id).unwrap().unwrap();
        assert_eq!(svc.service_name.as_deref(), Some("smtp"));
        assert_eq!(svc.detected_ms, 1);
    }

    #[test]
    fn state_change_is_silent_overwrite() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(161)])]), 1).unwrap();
        let mut p = tcp(161);
        p.state = "filtered".into();
        let s = snapshot(vec![host("10.0.0.1", vec![p])]);
        assert_eq!(r.ingest_at(&mut db, &s, 2).unwrap().events_created, 0);
        assert_eq!(ports_of(&db, "10.0.0.1")[0].state, "filtered");
    }

    #[test]
    fn duplicate_host_entries_are_merged() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(22), tcp(80)])]), 1).unwrap();
        let s = snapshot(vec![host("10.0.0.1", vec![tcp(22)]), host("10.0.0.1", vec![tcp(80)])]);
        let sum = r.ingest_at(&mut db, &s, 2).unwrap();
        assert_eq!(sum.hosts_processed, 2);
        assert_eq!(sum.events_created, 0);
        assert!(ports_of(&db, "10.0.0.1").iter().all(|p| p.active));
    }

    #[test]
    fn other_hosts_are_independent() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(22)]), host("10.0.0.2", vec![tcp(22)])]), 1).unwrap();
        let s = snapshot(vec![host("10.0.0.2", vec![])]);
        r.ingest_at(&mut db, &s, 2).unwrap();
        assert_eq!(kinds(&db, &s).len(), 1);
        assert!(ports_of(&db, "10.0.0.1")[0].active);
        assert!(!ports_of(&db, "10.0.0.2")[0].active);
    }

    #[test]
    fn address_spelling_and_protocol_case_share_identity() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let a = snapshot(vec![host("2001:DB8:0:0::1", vec![tcp(22)])]);
        assert_eq!(r.ingest_at(&mut db, &a, 1).unwrap().events_created, 2);

        let mut upper = tcp(22);
        upper.protocol = "TCP".into();
        let b = snapshot(vec![host("2001:db8::1", vec![upper])]);
        assert_eq!(r.ingest_at(&mut db, &b, 2).unwrap().events_created, 0);

        assert_eq!(db.count_rows("hosts").unwrap(), 1);
        assert_eq!(db.count_rows("ports").unwrap(), 1);
        let p = ports_of(&db, "2001:db8::1");
        assert_eq!((p[0].protocol.as_str(), p[0].active, p[0].last_seen_ms), ("tcp", true, 2));
    }

    #[test]
    fn malformed_snapshot_changes_nothing() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        let s = snapshot(vec![host("10.0.0.1", vec![tcp(22)]), host("10.0.0.300", vec![])]);
        let err = r.ingest_at(&mut db, &s, 1).unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(db.count_rows("hosts").unwrap(), 0);
        assert_eq!(db.count_rows("scan_events").unwrap(), 0);
    }

    #[test]
    fn failure_mid_snapshot_rolls_back_everything() {
        let mut db = Db::open_in_memory().unwrap();
        let r = Reconciler::default();
        r.ingest_at(&mut db, &snapshot(vec![host("10.0.0.1", vec![tcp(22)])]), 1).unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER fail_third BEFORE INSERT ON hosts WHEN NEW.address='10.0.0.3'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();
        let hosts_before = db.count_rows("hosts").unwrap();
        let events_before = db.count_rows("scan_events").unwrap();

        let s = snapshot(
            (1..=5).map(|i| host(&format!("10.0.0.{i}"), vec![tcp(443)])).collect(),
        );
        let err = r.ingest_at(&mut db, &s, 2).unwrap_err();
        assert!(matches!(err, ReconcileError::Storage(_)), "{err}");
        assert!(!err.is_client_error());

        assert_eq!(db.count_rows("hosts").unwrap(), hosts_before);
        assert_eq!(db.count_rows("scan_events").unwrap(), events_before);
        assert!(kinds(&db, &s).is_empty());
        // Host 1 was processed before the failure; its changes are gone too
        let p = ports_of(&db, "10.0.0.1");
        assert_eq!(p.len(), 1);
        assert_eq!((p[0].port, p[0].last_seen_ms), (22, 1));
        assert!(db.host_by_address("10.0.0.2").unwrap().is_none());
        // Locks were released with the failed snapshot
        assert_eq!(r.locks().tracked(), 0);
    }

    #[test]
    fn other_host_waits_out_a_long_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv.db");
        let mut db = Db::open_or_create(&path).unwrap();
        db.set_busy_timeout(std::time::Duration::from_millis(20)).unwrap();
        let r = Reconciler::default();

        // Another writer keeps the database locked well past the busy timeout
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let p = path.clone();
        let writer = std::thread::spawn(move || {
            let mut other = Db::open_or_create(&p).unwrap();
            let tx = other.snapshot_tx().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
            tx.commit().unwrap();
        });
        held_rx.recv().unwrap();

        let s = snapshot(vec![host("10.9.9.9", vec![tcp(22)])]);
        let sum = r.ingest(&mut db, &s).unwrap();
        assert_eq!(sum.events_created, 2);
        writer.join().unwrap();
        assert!(db.host_by_address("10.9.9.9").unwrap().is_some());
    }

    #[test]
    fn concurrent_same_host_snapshots_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv.db");
        Db::open_or_create(&path).unwrap();
        let r = std::sync::Arc::new(Reconciler::default());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let r = r.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut db = Db::open_or_create(&path).unwrap();
                    for round in 0..5 {
                        let ports = if (i + round) % 2 == 0 { vec![tcp(22), tcp(80)] } else { vec![tcp(22), tcp(443)] };
                        r.ingest(&mut db, &snapshot(vec![host("10.0.0.1", ports)])).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let db = Db::open_or_create(&path).unwrap();
        assert_eq!(db.count_rows("hosts").unwrap(), 1);
        let discovered = db
            .list_events(&inventory_sqlite::EventFilter { event_types: vec![EventType::HostDiscovered], ..Default::default() })
            .unwrap();
        assert_eq!(discovered.len(), 1);
        // Exactly one of 80/443 is active, 22 always is
        let active: Vec<u16> = ports_of(&db, "10.0.0.1").into_iter().filter(|p| p.active).map(|p| p.port).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&22));
        // Every close of a port follows an open of it
        let mut all = db
            .list_events(&inventory_sqlite::EventFilter { limit: 1000, ..Default::default() })
            .unwrap();
        all.sort_by_key(|e| e.event_id);
        let mut open: std::collections::HashMap<i64, bool> = Default::default();
        for e in all.iter().filter(|e| e.port_id.is_some()) {
            let id = e.port_id.unwrap();
            match e.event_type {
                EventType::PortOpened => assert!(!open.insert(id, true).unwrap_or(false)),
                EventType::PortClosed => assert!(open.insert(id, false).unwrap_or(false)),
                EventType::HostDiscovered => {}
            }
        }
    }
}
