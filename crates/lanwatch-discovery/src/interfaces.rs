//! Network interface providers
//!
//! The engine asks a provider for the current IPv4 interfaces and listens to
//! its ADD/REMOVE stream. [`SystemInterfaces`] polls the OS table;
//! [`ManualInterfaces`] is driven by the embedding application.

use anyhow::Result;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the change broadcast channel
const EVENT_CAPACITY: usize = 64;

/// Addressing of one local interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// OS interface index, when known
    #[serde(default)]
    pub index: Option<u32>,
}

impl InterfaceInfo {
    pub fn new(ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            ip,
            netmask,
            index: None,
        }
    }

    /// Directed broadcast address of the interface's subnet
    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Add,
    Remove,
}

/// One change in the available interface set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEvent {
    pub status: InterfaceStatus,
    pub name: String,
    pub info: InterfaceInfo,
}

/// Source of the available interface set and its changes
pub trait InterfaceProvider: Send + Sync + 'static {
    /// Interfaces currently usable, keyed by name
    fn interfaces(&self) -> HashMap<String, InterfaceInfo>;

    /// Stream of ADD/REMOVE changes
    fn subscribe(&self) -> broadcast::Receiver<InterfaceEvent>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Compute the events turning `old` into `new`.
///
/// An interface whose addressing changed is reported as REMOVE then ADD.
pub fn diff_interfaces(
    old: &HashMap<String, InterfaceInfo>,
    new: &HashMap<String, InterfaceInfo>,
) -> Vec<InterfaceEvent> {
    let mut events = Vec::new();

    let mut removed: Vec<_> = old
        .iter()
        .filter(|(name, info)| new.get(*name) != Some(*info))
        .collect();
    removed.sort_by(|a, b| a.0.cmp(b.0));
    for (name, info) in removed {
        events.push(InterfaceEvent {
            status: InterfaceStatus::Remove,
            name: name.clone(),
            info: *info,
        });
    }

    let mut added: Vec<_> = new
        .iter()
        .filter(|(name, info)| old.get(*name) != Some(*info))
        .collect();
    added.sort_by(|a, b| a.0.cmp(b.0));
    for (name, info) in added {
        events.push(InterfaceEvent {
            status: InterfaceStatus::Add,
            name: name.clone(),
            info: *info,
        });
    }

    events
}

/// Provider driven by explicit `add`/`remove` calls
pub struct ManualInterfaces {
    interfaces: Mutex<HashMap<String, InterfaceInfo>>,
    events: broadcast::Sender<InterfaceEvent>,
}

impl Default for ManualInterfaces {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            interfaces: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl ManualInterfaces {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace an interface and announce it
    pub fn add(&self, name: &str, info: InterfaceInfo) {
        let previous = lock(&self.interfaces).insert(name.to_string(), info);
        if let Some(previous) = previous {
            if previous == info {
                return;
            }
            self.emit(InterfaceStatus::Remove, name, previous);
        }
        self.emit(InterfaceStatus::Add, name, info);
    }

    /// Remove an interface and announce it, if present
    pub fn remove(&self, name: &str) {
        let removed = lock(&self.interfaces).remove(name);
        if let Some(info) = removed {
            self.emit(InterfaceStatus::Remove, name, info);
        }
    }

    fn emit(&self, status: InterfaceStatus, name: &str, info: InterfaceInfo) {
        // No receivers is fine
        let _ = self.events.send(InterfaceEvent {
            status,
            name: name.to_string(),
            info,
        });
    }
}

impl InterfaceProvider for ManualInterfaces {
    fn interfaces(&self) -> HashMap<String, InterfaceInfo> {
        lock(&self.interfaces).clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<InterfaceEvent> {
        self.events.subscribe()
    }
}

/// Configuration for OS interface polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInterfacesConfig {
    /// How often to re-read the OS interface table
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Interface name prefixes never reported
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,
}

impl Default for SystemInterfacesConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            ignore_prefixes: default_ignore_prefixes(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ignore_prefixes() -> Vec<String> {
    ["lo", "docker", "br-", "veth"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Provider backed by the OS interface table
pub struct SystemInterfaces {
    config: SystemInterfacesConfig,
    interfaces: Mutex<HashMap<String, InterfaceInfo>>,
    events: broadcast::Sender<InterfaceEvent>,
}

impl SystemInterfaces {
    /// Read the interface table once; call [`SystemInterfaces::spawn`] to keep it current
    pub fn new(config: SystemInterfacesConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let interfaces = read_interfaces(&config.ignore_prefixes).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read network interfaces");
            HashMap::new()
        });
        info!(count = interfaces.len(), "Network interfaces loaded");
        Arc::new(Self {
            config,
            interfaces: Mutex::new(interfaces),
            events,
        })
    }

    /// Re-read the OS table and announce differences
    pub fn refresh(&self) -> Result<()> {
        let current = read_interfaces(&self.config.ignore_prefixes)?;
        let events = {
            let mut known = lock(&self.interfaces);
            let events = diff_interfaces(&known, &current);
            *known = current;
            events
        };

        for event in events {
            info!(
                interface = %event.name,
                ip = %event.info.ip,
                status = ?event.status,
                "Network interface changed"
            );
            let _ = self.events.send(event);
        }
        Ok(())
    }

    /// Poll the OS table until the provider is dropped
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(provider) = weak.upgrade() else {
                    debug!("Interface provider dropped, stopping poller");
                    break;
                };
                if let Err(e) = provider.refresh() {
                    warn!(error = %e, "Failed to refresh network interfaces");
                }
            }
        })
    }
}

impl InterfaceProvider for SystemInterfaces {
    fn interfaces(&self) -> HashMap<String, InterfaceInfo> {
        lock(&self.interfaces).clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<InterfaceEvent> {
        self.events.subscribe()
    }
}

/// Read IPv4 interfaces from the OS, skipping ignored prefixes
fn read_interfaces(ignore_prefixes: &[String]) -> Result<HashMap<String, InterfaceInfo>> {
    let interfaces = NetworkInterface::show()?
        .into_iter()
        .filter(|iface| !ignore_prefixes.iter().any(|p| iface.name.starts_with(p.as_str())))
        .filter_map(|iface| {
            let info = iface.addr.iter().find_map(|addr| match addr {
                Addr::V4(v4) if !v4.ip.is_loopback() => Some(InterfaceInfo {
                    ip: v4.ip,
                    // Assume /24 when the OS reports no mask
                    netmask: v4.netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
                    index: Some(iface.index),
                }),
                _ => None,
            })?;
            Some((iface.name, info))
        })
        .collect();
    Ok(interfaces)
}
