//! Device types for tracking peers seen on the LAN

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// Unique identifier for a device, the decimal form of the 64-bit id it announces
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId from the raw id carried in a probe
    pub fn from_raw(raw: u64) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Snapshot of a device as seen by subscribers and `list_devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanDeviceInfo {
    pub id: DeviceId,
    pub online: bool,
    pub ip: Option<IpAddr>,
}

/// A peer tracked by the registry
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    /// Whether a keep-alive arrived within the timeout
    pub online: bool,
    /// Last-seen source address
    pub ip: Option<IpAddr>,
    /// Local interface the last keep-alive arrived on
    pub interface_name: Option<String>,
    /// Local wall clock minus the timestamp carried in the last datagram, in seconds
    pub clock_offset: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// The single outstanding keep-alive timer; `None` when canceled or fired
    pub keepalive_deadline: Option<Instant>,
}

impl Device {
    /// Create a new, offline device with no timer armed
    pub fn new(id: DeviceId, ip: Option<IpAddr>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            online: false,
            ip,
            interface_name: None,
            clock_offset: 0,
            first_seen: now,
            last_seen: now,
            keepalive_deadline: None,
        }
    }

    pub fn info(&self) -> LanDeviceInfo {
        LanDeviceInfo {
            id: self.id.clone(),
            online: self.online,
            ip: self.ip,
        }
    }
}
