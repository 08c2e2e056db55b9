pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE hosts (
  host_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  address         TEXT NOT NULL UNIQUE,
  hostname        TEXT,
  mac_address     TEXT,
  first_seen_ms   INTEGER NOT NULL,
  last_seen_ms    INTEGER NOT NULL,
  active          INTEGER NOT NULL CHECK (active IN (0,1)) DEFAULT 1,
  created_ms      INTEGER NOT NULL,
  updated_ms      INTEGER NOT NULL
);

CREATE TABLE ports (
  port_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(host_id) ON DELETE CASCADE,
  port            INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  protocol        TEXT NOT NULL DEFAULT 'tcp',
  state           TEXT NOT NULL DEFAULT 'open',
  first_seen_ms   INTEGER NOT NULL,
  last_seen_ms    INTEGER NOT NULL,
  active          INTEGER NOT NULL CHECK (active IN (0,1)) DEFAULT 1,
  UNIQUE (host_id, port, protocol)
);

CREATE TABLE services (
  service_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  port_id          INTEGER NOT NULL UNIQUE REFERENCES ports(port_id) ON DELETE CASCADE,
  service_name     TEXT,
  service_version  TEXT,
  banner           TEXT,
  fingerprint_json TEXT,
  detected_ms      INTEGER NOT NULL
);

CREATE TABLE scan_events (
  event_id        INTEGER PRIMARY KEY AUTOINCREMENT,
  scan_id         TEXT NOT NULL,
  event_type      TEXT NOT NULL CHECK (event_type IN ('host_discovered','port_opened','port_closed')),
  host_id         INTEGER REFERENCES hosts(host_id) ON DELETE SET NULL,
  port_id         INTEGER REFERENCES ports(port_id) ON DELETE SET NULL,
  details_json    TEXT,
  created_ms      INTEGER NOT NULL
);

CREATE TABLE annotations (
  annotation_id   INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER REFERENCES hosts(host_id) ON DELETE CASCADE,
  port_id         INTEGER REFERENCES ports(port_id) ON DELETE CASCADE,
  note            TEXT NOT NULL,
  created_ms      INTEGER NOT NULL,
  updated_ms      INTEGER NOT NULL
);

CREATE INDEX idx_hosts_active ON hosts(active);
CREATE INDEX idx_ports_host_active ON ports(host_id, active);
CREATE INDEX idx_events_scan ON scan_events(scan_id);
CREATE INDEX idx_events_created ON scan_events(created_ms);
CREATE INDEX idx_events_host ON scan_events(host_id);
CREATE INDEX idx_annotations_host ON annotations(host_id);
CREATE INDEX idx_annotations_port ON annotations(port_id);

COMMIT;
"#
;
