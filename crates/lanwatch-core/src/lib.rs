//! lanwatch Core - Protocol types, probe codec, and device registry
//!
//! This crate provides the transport-free pieces of the lanwatch system:
//! - Probe codec for the fixed 32-byte discovery/keep-alive datagram
//! - Device types for tracking peers seen on the LAN
//! - Device registry implementing the keep-alive state machine
//! - Scan schedule with exponential back-off

pub mod device;
pub mod probe;
pub mod registry;
pub mod schedule;

pub use device::{Device, DeviceId, LanDeviceInfo};
pub use probe::{Probe, ProbeError, OT_HEADER, OT_MSG_LEN, OT_PORT, OT_PROBE_LEN};
pub use registry::DeviceRegistry;
pub use schedule::ScanSchedule;
