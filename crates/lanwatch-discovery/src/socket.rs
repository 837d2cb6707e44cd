//! Per-interface broadcast sockets
//!
//! Exactly one socket exists per interface that is both requested and
//! available. All sockets share one local port, chosen by the first
//! successful bind. Must be used from inside the worker runtime.

use lanwatch_core::probe::has_header;
use lanwatch_core::OT_MSG_LEN;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::interfaces::InterfaceInfo;

/// A datagram that passed the header check, tagged with its interface
#[derive(Debug, Clone)]
pub struct Datagram {
    pub if_name: String,
    pub source: SocketAddr,
    pub data: Vec<u8>,
}

struct Binding {
    socket: Arc<UdpSocket>,
    info: InterfaceInfo,
    reader: JoinHandle<()>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        // Deregister the read watch; the socket closes with the last Arc
        self.reader.abort();
    }
}

/// Owns the interface sockets and their reader tasks
pub struct SocketManager {
    bindings: HashMap<String, Binding>,
    local_port: Option<u16>,
    datagrams: mpsc::UnboundedSender<Datagram>,
}

impl SocketManager {
    pub fn new(datagrams: mpsc::UnboundedSender<Datagram>) -> Self {
        Self {
            bindings: HashMap::new(),
            local_port: None,
            datagrams,
        }
    }

    /// Port shared by every socket, once one bind has succeeded
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn contains(&self, if_name: &str) -> bool {
        self.bindings.contains_key(if_name)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Create and register a socket for `if_name`. Failures are logged; the
    /// interface then stays without a socket until its next ADD.
    pub fn create(&mut self, if_name: &str, info: InterfaceInfo) {
        if self.bindings.contains_key(if_name) {
            info!(interface = %if_name, "Socket already created");
            return;
        }

        let socket = match self.open(if_name, &info) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!(interface = %if_name, error = %e, "Failed to create socket");
                return;
            }
        };

        if self.local_port.is_none() {
            match socket.local_addr() {
                Ok(addr) => self.local_port = Some(addr.port()),
                Err(e) => warn!(interface = %if_name, error = %e, "Failed to read local port"),
            }
        }

        let reader = spawn_reader(if_name.to_string(), socket.clone(), self.datagrams.clone());
        self.bindings.insert(
            if_name.to_string(),
            Binding {
                socket,
                info,
                reader,
            },
        );
        info!(interface = %if_name, port = ?self.local_port, "Created socket");
    }

    fn open(&self, if_name: &str, info: &InterfaceInfo) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        bind_to_interface(&socket, if_name, info);

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.local_port.unwrap_or(0)));
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into())
    }

    /// Deregister and close the socket for `if_name`, if any
    pub fn destroy(&mut self, if_name: &str) {
        if self.bindings.remove(if_name).is_some() {
            info!(interface = %if_name, "Destroyed socket");
        }
    }

    /// Close every socket
    pub fn teardown(&mut self) {
        let names: Vec<String> = self.bindings.keys().cloned().collect();
        for name in names {
            self.destroy(&name);
        }
    }

    /// Send `data` to `target:port`, or to the broadcast address when no target
    /// is given. With `if_name` only that interface is used, otherwise all.
    pub fn send(&self, if_name: Option<&str>, target: Option<IpAddr>, port: u16, data: &[u8]) {
        match if_name {
            None => {
                for (name, binding) in &self.bindings {
                    debug!(interface = %name, "Send broadcast");
                    send_on(name, binding, target, port, data);
                }
            }
            Some(name) => match self.bindings.get(name) {
                Some(binding) => send_on(name, binding, target, port, data),
                None => error!(interface = %name, "No socket for interface"),
            },
        }
    }
}

/// Limited broadcast (or no target) becomes the interface's directed broadcast
pub fn destination(info: &InterfaceInfo, target: Option<IpAddr>) -> IpAddr {
    match target {
        None => IpAddr::V4(info.broadcast_address()),
        Some(IpAddr::V4(ip)) if ip == Ipv4Addr::BROADCAST => IpAddr::V4(info.broadcast_address()),
        Some(ip) => ip,
    }
}

fn send_on(if_name: &str, binding: &Binding, target: Option<IpAddr>, port: u16, data: &[u8]) {
    let dest = SocketAddr::new(destination(&binding.info, target), port);
    match binding.socket.try_send_to(data, dest) {
        Ok(_) => trace!(interface = %if_name, dest = %dest, "Probe sent"),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::WouldBlock
            ) =>
        {
            debug!(interface = %if_name, dest = %dest, error = %e, "Skip send");
        }
        Err(e) => error!(interface = %if_name, dest = %dest, error = %e, "Send failed"),
    }
}

fn spawn_reader(
    if_name: String,
    socket: Arc<UdpSocket>,
    datagrams: mpsc::UnboundedSender<Datagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; OT_MSG_LEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    let data = &buf[..len];
                    if !has_header(data) {
                        trace!(interface = %if_name, source = %source, len, "Dropped foreign datagram");
                        continue;
                    }
                    let datagram = Datagram {
                        if_name: if_name.clone(),
                        source,
                        data: data.to_vec(),
                    };
                    if datagrams.send(datagram).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(interface = %if_name, error = %e, "Socket read error");
                }
            }
        }
    })
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_interface(socket: &Socket, if_name: &str, _info: &InterfaceInfo) {
    if let Err(e) = socket.bind_device(Some(if_name.as_bytes())) {
        warn!(interface = %if_name, error = %e, "Bind socket to interface failed");
    }
}

#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos"
))]
fn bind_to_interface(socket: &Socket, if_name: &str, info: &InterfaceInfo) {
    use std::num::NonZeroU32;

    let Some(index) = info.index.and_then(NonZeroU32::new) else {
        warn!(interface = %if_name, "Interface index unknown, socket not bound to interface");
        return;
    };
    if let Err(e) = socket.bind_device_by_index_v4(Some(index)) {
        warn!(interface = %if_name, error = %e, "Bind socket to interface failed");
    }
}

#[cfg(not(any(
    target_os = "android",
    target_os = "fuchsia",
    target_os = "linux",
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos"
)))]
fn bind_to_interface(_socket: &Socket, if_name: &str, _info: &InterfaceInfo) {
    warn!(interface = %if_name, "Interface binding unsupported, socket left unbound");
}
