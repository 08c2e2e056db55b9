use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub type HostId = i64;
pub type PortId = i64;
pub type ServiceId = i64;
pub type EventId = i64;

/// Whether an identity lookup found the record or had to create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Created,
    Existing,
}

impl Resolution {
    pub fn is_created(self) -> bool {
        self == Resolution::Created
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub host_id: HostId,
    pub address: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    pub port_id: PortId,
    pub host_id: HostId,
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub service_id: ServiceId,
    pub port_id: PortId,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub banner: Option<String>,
    pub fingerprint_json: Option<String>,
    pub detected_ms: i64,
}

/// The overwritable content of a service slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFields {
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub banner: Option<String>,
    pub fingerprint_json: Option<String>,
}

impl Service {
    pub fn fields(&self) -> ServiceFields {
        ServiceFields {
            service_name: self.service_name.clone(),
            service_version: self.service_version.clone(),
            banner: self.banner.clone(),
            fingerprint_json: self.fingerprint_json.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    HostDiscovered,
    PortOpened,
    PortClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::HostDiscovered => "host_discovered",
            EventType::PortOpened => "port_opened",
            EventType::PortClosed => "port_closed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host_discovered" => Ok(EventType::HostDiscovered),
            "port_opened" => Ok(EventType::PortOpened),
            "port_closed" => Ok(EventType::PortClosed),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

/// An event about to be appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub host_id: Option<HostId>,
    pub port_id: Option<PortId>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanEvent {
    pub event_id: EventId,
    pub scan_id: String,
    pub event_type: EventType,
    pub host_id: Option<HostId>,
    pub port_id: Option<PortId>,
    pub details: serde_json::Value,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub skip: usize,
    pub limit: usize,
    pub event_types: Vec<EventType>,
    pub scan_id: Option<Uuid>,
    pub host_id: Option<HostId>,
}

/// Paging for host and port listings. A zero limit means the default page of 100.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub skip: usize,
    pub limit: usize,
    pub active_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    pub skip: usize,
    pub limit: usize,
    pub active_only: bool,
    pub host_id: Option<HostId>,
}

/// A host row as listed: its active port count and newest note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    #[serde(flatten)]
    pub host: Host,
    pub port_count: i64,
    pub latest_annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDetail {
    #[serde(flatten)]
    pub port: Port,
    pub service: Option<Service>,
}

/// One host with its active ports and their service slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDetail {
    #[serde(flatten)]
    pub host: Host,
    pub port_count: usize,
    pub ports: Vec<PortDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSummary {
    pub port: u16,
    pub protocol: String,
    pub host_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_hosts: i64,
    pub active_hosts: i64,
    pub total_ports: i64,
    pub active_ports: i64,
    pub recent_events_count: i64,
}

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// RFC 3339 rendering of a millisecond timestamp; empty on overflow.
pub fn format_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}
