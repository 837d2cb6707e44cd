//! Device registry and keep-alive state machine
//!
//! Every mutation returns the change event it produced (if any) instead of
//! notifying anyone itself, so the caller decides how events are delivered.
//! Timer state is a plain deadline per device; the owner polls
//! [`DeviceRegistry::next_deadline`] and calls [`DeviceRegistry::expire`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::device::{Device, DeviceId, LanDeviceInfo};
use crate::probe::Probe;

/// How long a device stays online without a keep-alive
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
    keepalive_timeout: Duration,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_TIMEOUT)
    }
}

impl DeviceRegistry {
    pub fn new(keepalive_timeout: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            keepalive_timeout,
        }
    }

    /// Change the timeout for deadlines armed from now on
    pub fn set_keepalive_timeout(&mut self, timeout: Duration) {
        self.keepalive_timeout = timeout;
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Snapshot of every known device
    pub fn snapshot(&self) -> HashMap<String, LanDeviceInfo> {
        self.devices
            .values()
            .map(|d| (d.id.0.clone(), d.info()))
            .collect()
    }

    /// Apply one decoded datagram received from `ip` on `if_name`.
    ///
    /// Any datagram records clock offset and last-seen time. Only a keep-alive
    /// re-arms the deadline, brings the device online and updates its address.
    pub fn apply_probe(
        &mut self,
        probe: &Probe,
        ip: IpAddr,
        if_name: &str,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<LanDeviceInfo> {
        let id = DeviceId::from_raw(probe.device_id);
        let device = self.devices.entry(id.clone()).or_insert_with(|| {
            info!(device = %id, ip = %ip, "New device");
            Device::new(id, Some(ip), wall)
        });

        device.clock_offset = wall.timestamp() - i64::from(probe.timestamp);
        device.last_seen = wall;

        if !probe.keep_alive {
            return None;
        }

        let mut changed = false;
        if !device.online {
            changed = true;
            device.online = true;
            info!(device = %device.id, ip = %ip, "Device online");
        }
        if device.ip != Some(ip) {
            changed = true;
            device.ip = Some(ip);
            info!(device = %device.id, ip = %ip, "Device ip changed");
        }
        if device.interface_name.as_deref() != Some(if_name) {
            changed = true;
            device.interface_name = Some(if_name.to_string());
            info!(device = %device.id, interface = %if_name, "Device interface changed");
        }

        // Replaces any deadline still pending
        device.keepalive_deadline = Some(now + self.keepalive_timeout);

        changed.then(|| device.info())
    }

    /// Manually override the online flag. Notifies only on an actual change.
    pub fn set_online(&mut self, id: &DeviceId, online: bool) -> Option<LanDeviceInfo> {
        let device = self.devices.get_mut(id)?;
        if device.online == online {
            return None;
        }
        device.online = online;
        debug!(device = %id, online, "Device status changed");
        Some(device.info())
    }

    /// Manually override the address. Notifies only on an actual change.
    pub fn set_ip(&mut self, id: &DeviceId, ip: Option<IpAddr>) -> Option<LanDeviceInfo> {
        let device = self.devices.get_mut(id)?;
        if device.ip == ip {
            return None;
        }
        device.ip = ip;
        debug!(device = %id, ip = ?ip, "Device ip changed");
        Some(device.info())
    }

    /// Earliest pending keep-alive deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.devices
            .values()
            .filter_map(|d| d.keepalive_deadline)
            .min()
    }

    /// Fire every deadline at or before `now`, returning the offline events
    pub fn expire(&mut self, now: Instant) -> Vec<LanDeviceInfo> {
        let mut events = Vec::new();
        for device in self.devices.values_mut() {
            match device.keepalive_deadline {
                Some(deadline) if deadline <= now => {
                    device.keepalive_deadline = None;
                    if device.online {
                        device.online = false;
                        info!(device = %device.id, "Device offline, keep-alive timed out");
                        events.push(device.info());
                    }
                }
                _ => {}
            }
        }
        events
    }

    /// Cancel every timer and mark every device offline without notifying
    pub fn teardown(&mut self) {
        for device in self.devices.values_mut() {
            device.keepalive_deadline = None;
            device.online = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn keep_alive(id: u64) -> Probe {
        Probe {
            device_id: id,
            timestamp: 1_000,
            keep_alive: true,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_first_keep_alive_brings_device_online() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();

        let event = registry
            .apply_probe(&keep_alive(0x0102030405060708), ip(50), "eth0", now, Utc::now())
            .unwrap();

        assert!(event.online);
        assert_eq!(event.id.as_str(), "72623859790382856");
        assert_eq!(event.ip, Some(ip(50)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot["72623859790382856"].online);
        assert_eq!(registry.next_deadline(), Some(now + Duration::from_secs(100)));
    }

    #[test]
    fn test_refresh_without_change_is_silent() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());

        let later = now + Duration::from_secs(10);
        assert!(registry
            .apply_probe(&keep_alive(1), ip(2), "eth0", later, Utc::now())
            .is_none());
        assert_eq!(registry.next_deadline(), Some(later + Duration::from_secs(100)));
    }

    #[test]
    fn test_ip_and_interface_changes_notify() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());

        let event = registry
            .apply_probe(&keep_alive(1), ip(2), "wlan0", now, Utc::now())
            .unwrap();
        assert!(event.online);
        assert_eq!(event.ip, Some(ip(2)));
        let dev = registry.get(&DeviceId::from("1")).unwrap();
        assert_eq!(dev.interface_name.as_deref(), Some("wlan0"));

        let event = registry
            .apply_probe(&keep_alive(1), ip(3), "wlan0", now, Utc::now())
            .unwrap();
        assert_eq!(event.ip, Some(ip(3)));
    }

    #[test]
    fn test_timeout_fires_exactly_one_offline_event() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());

        assert!(registry.expire(now + Duration::from_secs(99)).is_empty());

        let events = registry.expire(now + Duration::from_secs(100));
        assert_eq!(events.len(), 1);
        assert!(!events[0].online);
        assert_eq!(events[0].ip, Some(ip(2)));

        assert!(registry.next_deadline().is_none());
        assert!(registry.expire(now + Duration::from_secs(500)).is_empty());
        // Known but offline
        assert!(!registry.snapshot()["1"].online);
    }

    #[test]
    fn test_refresh_before_deadline_keeps_device_online() {
        let mut registry = DeviceRegistry::default();
        let mut now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());

        for _ in 0..20 {
            now += Duration::from_secs(99);
            assert!(registry.expire(now).is_empty());
            assert!(registry
                .apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now())
                .is_none());
        }
        assert!(registry.snapshot()["1"].online);
    }

    #[test]
    fn test_offline_device_comes_back() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());
        registry.expire(now + Duration::from_secs(100));

        let later = now + Duration::from_secs(200);
        let event = registry
            .apply_probe(&keep_alive(1), ip(2), "eth0", later, Utc::now())
            .unwrap();
        assert!(event.online);
    }

    #[test]
    fn test_non_keep_alive_updates_metadata_only() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        let wall = Utc::now();
        let probe = Probe {
            device_id: 5,
            timestamp: 100,
            keep_alive: false,
        };

        assert!(registry.apply_probe(&probe, ip(9), "eth0", now, wall).is_none());

        let dev = registry.get(&DeviceId::from("5")).unwrap();
        assert!(!dev.online);
        assert_eq!(dev.ip, Some(ip(9)));
        assert_eq!(dev.clock_offset, wall.timestamp() - 100);
        assert!(dev.keepalive_deadline.is_none());
        assert!(dev.interface_name.is_none());
    }

    #[test]
    fn test_manual_setters_notify_only_on_change() {
        let mut registry = DeviceRegistry::default();
        let id = DeviceId::from("1");
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());

        assert!(registry.set_online(&id, true).is_none());
        assert!(!registry.set_online(&id, false).unwrap().online);
        assert!(registry.set_ip(&id, Some(ip(2))).is_none());
        assert_eq!(registry.set_ip(&id, None).unwrap().ip, None);

        assert!(registry.set_online(&DeviceId::from("404"), true).is_none());
    }

    #[test]
    fn test_teardown_is_silent() {
        let mut registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.apply_probe(&keep_alive(1), ip(2), "eth0", now, Utc::now());
        registry.apply_probe(&keep_alive(2), ip(3), "eth0", now, Utc::now());

        registry.teardown();

        assert!(registry.next_deadline().is_none());
        assert!(registry.snapshot().values().all(|d| !d.online));
        assert!(registry.expire(now + Duration::from_secs(1000)).is_empty());
    }
}
