//! Core snapshot types shared by the reconciler, the API and the CLI.

pub mod hostlock;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use uuid::Uuid;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// One scanner submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub scan_id: Uuid,
    pub hosts: Vec<SnapshotHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHost {
    pub ip_address: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub ports: Vec<SnapshotPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPort {
    pub port_number: i64,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub service_version: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub fingerprint_data: Option<serde_json::Value>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_state() -> String {
    "open".to_string()
}

/// Natural key of a port within its host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortKey {
    pub number: u16,
    pub protocol: String,
}

impl std::fmt::Display for PortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("host #{index}: invalid ip address '{value}'")]
    InvalidAddress { index: usize, value: String },
    #[error("host {ip}: invalid port number {value}")]
    InvalidPort { ip: String, value: i64 },
    #[error("host {ip}: port {port} has an empty {field}")]
    EmptyField { ip: String, port: i64, field: &'static str },
}

/// Returns `Some(trimmed)` only when the value carries non-whitespace text.
pub fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

impl ScanSnapshot {
    /// Rejects malformed snapshots before anything touches the store.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (index, host) in self.hosts.iter().enumerate() {
            if host.ip_address.trim().parse::<IpAddr>().is_err() {
                return Err(SnapshotError::InvalidAddress { index, value: host.ip_address.clone() });
            }
            for port in &host.ports {
                port.key().ok_or_else(|| SnapshotError::InvalidPort {
                    ip: host.ip_address.clone(),
                    value: port.port_number,
                })?;
                if port.protocol.trim().is_empty() {
                    return Err(SnapshotError::EmptyField { ip: host.ip_address.clone(), port: port.port_number, field: "protocol" });
                }
                if port.state.trim().is_empty() {
                    return Err(SnapshotError::EmptyField { ip: host.ip_address.clone(), port: port.port_number, field: "state" });
                }
            }
        }
        Ok(())
    }

    /// Distinct host addresses, sorted. This is the lock acquisition order.
    pub fn host_addresses(&self) -> Vec<String> {
        let set: HashSet<String> = self.hosts.iter().map(|h| h.address()).collect();
        let mut v: Vec<String> = set.into_iter().collect();
        v.sort();
        v
    }

    pub fn port_count(&self) -> usize {
        self.hosts.iter().map(|h| h.ports.len()).sum()
    }
}

impl SnapshotHost {
    /// Canonical textual form of the address, so two spellings of the same
    /// IPv6 address cannot create a second identity. Falls back to the trimmed input.
    pub fn address(&self) -> String {
        let raw = self.ip_address.trim();
        raw.parse::<IpAddr>().map(|ip| ip.to_string()).unwrap_or_else(|_| raw.to_string())
    }
}

impl SnapshotPort {
    /// `None` when the port number is outside 1..=65535.
    pub fn key(&self) -> Option<PortKey> {
        let number = u16::try_from(self.port_number).ok().filter(|n| *n != 0)?;
        Some(PortKey { number, protocol: self.protocol.trim().to_ascii_lowercase() })
    }

    /// A port carries service information when a name or banner is present.
    pub fn has_service(&self) -> bool {
        non_empty(self.service_name.as_deref()).is_some() || non_empty(self.banner.as_deref()).is_some()
    }
}
