//! lanwatch Discovery - UDP broadcast presence detection for LAN devices
//!
//! This crate runs the discovery protocol:
//! - Network interface providers (OS polling or manually driven)
//! - One broadcast socket per requested, available interface
//! - A background worker thread owning sockets, timers, and the registry
//! - Keyed subscribers notified of online/offline/address changes

pub mod config;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod socket;
pub mod subscribers;
mod worker;

pub use config::LanConfig;
pub use engine::LanDiscovery;
pub use error::DiscoveryError;
pub use interfaces::{
    InterfaceEvent, InterfaceInfo, InterfaceProvider, InterfaceStatus, ManualInterfaces,
    SystemInterfaces, SystemInterfacesConfig,
};
pub use lanwatch_core::{DeviceId, LanDeviceInfo};
