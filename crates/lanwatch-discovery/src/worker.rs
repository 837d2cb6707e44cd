//! Background discovery worker
//!
//! One dedicated OS thread runs a current-thread tokio runtime. Sockets,
//! timers, the device registry and the subscriber registry live on that
//! thread only; everything else talks to it through [`Command`]s.

use chrono::Utc;
use lanwatch_core::probe::encode_probe;
use lanwatch_core::{DeviceId, DeviceRegistry, LanDeviceInfo, Probe, ScanSchedule, OT_PROBE_LEN};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::config::LanConfig;
use crate::error::{DiscoveryError, Result};
use crate::interfaces::{diff_interfaces, InterfaceEvent, InterfaceInfo, InterfaceStatus};
use crate::socket::{Datagram, SocketManager};
use crate::subscribers::{EventSender, SubscriberRegistry};

/// Requests handled on the worker thread, each answered through `done`
pub(crate) enum Command {
    ListDevices {
        done: oneshot::Sender<HashMap<String, LanDeviceInfo>>,
    },
    Subscribe {
        key: String,
        sender: EventSender,
        done: oneshot::Sender<()>,
    },
    Unsubscribe {
        key: String,
        done: oneshot::Sender<()>,
    },
    Ping {
        if_name: Option<String>,
        target: Option<IpAddr>,
        done: oneshot::Sender<()>,
    },
    SetOnline {
        id: DeviceId,
        online: bool,
        done: oneshot::Sender<bool>,
    },
    SetIp {
        id: DeviceId,
        ip: Option<IpAddr>,
        done: oneshot::Sender<bool>,
    },
    LocalPort {
        done: oneshot::Sender<Option<u16>>,
    },
    Interface {
        event: InterfaceEvent,
        done: oneshot::Sender<()>,
    },
    /// Bring sockets in line with a full interface snapshot
    Reconcile {
        available: HashMap<String, InterfaceInfo>,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Registry state kept between worker runs
#[derive(Debug, Default)]
pub(crate) struct Parked {
    pub registry: DeviceRegistry,
    pub subscribers: SubscriberRegistry,
}

impl Parked {
    /// Override the online flag. Returns whether the device is known.
    pub fn set_online(&mut self, id: &DeviceId, online: bool) -> bool {
        let event = self.registry.set_online(id, online);
        self.publish(event);
        self.registry.get(id).is_some()
    }

    /// Override the address. Returns whether the device is known.
    pub fn set_ip(&mut self, id: &DeviceId, ip: Option<IpAddr>) -> bool {
        let event = self.registry.set_ip(id, ip);
        self.publish(event);
        self.registry.get(id).is_some()
    }

    fn publish(&mut self, events: impl IntoIterator<Item = LanDeviceInfo>) {
        for event in events {
            self.subscribers.notify(&event);
        }
    }
}

/// Caller-side handle on a running worker thread
pub(crate) struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    thread: thread::JoinHandle<Parked>,
}

impl WorkerHandle {
    /// Spawn the worker thread. Sockets and the first scan are set up on it.
    pub fn start(
        config: &LanConfig,
        virtual_id: u64,
        requested: HashSet<String>,
        available: HashMap<String, InterfaceInfo>,
        mut parked: Parked,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(DiscoveryError::WorkerStart)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        parked.registry.set_keepalive_timeout(config.keepalive_timeout());

        let worker = Worker {
            port: config.port,
            probe: encode_probe(virtual_id),
            requested,
            available,
            state: parked,
            sockets: SocketManager::new(datagram_tx),
            schedule: ScanSchedule::new(config.probe_interval_min(), config.probe_interval_max()),
            startup_jitter: config.startup_jitter(),
            next_scan: None,
            commands: command_rx,
            datagrams: datagram_rx,
        };

        let thread = thread::Builder::new()
            .name("lan-discovery".to_string())
            .spawn(move || runtime.block_on(worker.run()))
            .map_err(DiscoveryError::WorkerStart)?;

        Ok(Self { commands, thread })
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DiscoveryError::WorkerStopped)
    }

    /// Ask the worker to tear down and wait for its thread to exit
    pub async fn shutdown(self) -> Result<Parked> {
        // Already gone if the send fails; join still collects the state
        let _ = self.commands.send(Command::Shutdown);
        let thread = self.thread;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|_| DiscoveryError::WorkerPanicked)?
            .map_err(|_| DiscoveryError::WorkerPanicked)
    }

    /// Fire-and-forget shutdown for drop paths
    pub fn signal_shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Worker {
    port: u16,
    probe: [u8; OT_PROBE_LEN],
    requested: HashSet<String>,
    available: HashMap<String, InterfaceInfo>,
    state: Parked,
    sockets: SocketManager,
    schedule: ScanSchedule,
    startup_jitter: Duration,
    next_scan: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    datagrams: mpsc::UnboundedReceiver<Datagram>,
}

impl Worker {
    async fn run(mut self) -> Parked {
        info!("Discovery worker started");
        self.init_sockets();

        let jitter = random_jitter(self.startup_jitter);
        self.next_scan = Some(Instant::now() + jitter);
        debug!(delay_ms = jitter.as_millis() as u64, "First scan scheduled");

        loop {
            let scan_at = self.next_scan;
            let expire_at = self.state.registry.next_deadline().map(Instant::from_std);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(datagram) = self.datagrams.recv() => self.on_datagram(datagram),
                _ = sleep_until_some(scan_at) => self.scan(),
                _ = sleep_until_some(expire_at) => self.expire(),
            }
        }

        self.teardown();
        info!("Discovery worker exit");
        self.state
    }

    fn init_sockets(&mut self) {
        self.sockets.teardown();
        let mut names: Vec<&String> = self.requested.iter().collect();
        names.sort();
        for name in names {
            match self.available.get(name) {
                Some(info) => self.sockets.create(name, *info),
                None => debug!(interface = %name, "Requested interface not available"),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::ListDevices { done } => {
                let _ = done.send(self.state.registry.snapshot());
            }
            Command::Subscribe { key, sender, done } => {
                self.state.subscribers.insert(key, sender);
                let _ = done.send(());
            }
            Command::Unsubscribe { key, done } => {
                self.state.subscribers.remove(&key);
                let _ = done.send(());
            }
            Command::Ping {
                if_name,
                target,
                done,
            } => {
                debug!(interface = ?if_name, target = ?target, "Ping");
                self.ping(if_name.as_deref(), target);
                let _ = done.send(());
            }
            Command::SetOnline { id, online, done } => {
                let _ = done.send(self.state.set_online(&id, online));
            }
            Command::SetIp { id, ip, done } => {
                let _ = done.send(self.state.set_ip(&id, ip));
            }
            Command::LocalPort { done } => {
                let _ = done.send(self.sockets.local_port());
            }
            Command::Interface { event, done } => {
                self.on_interface_change(event);
                let _ = done.send(());
            }
            Command::Reconcile { available, done } => {
                self.reconcile(available);
                let _ = done.send(());
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn on_interface_change(&mut self, event: InterfaceEvent) {
        match event.status {
            InterfaceStatus::Add => {
                self.available.insert(event.name.clone(), event.info);
                if self.requested.contains(&event.name) {
                    self.sockets.create(&event.name, event.info);
                }
            }
            InterfaceStatus::Remove => {
                self.available.remove(&event.name);
                self.sockets.destroy(&event.name);
            }
        }
    }

    /// Apply the difference between the known and the reported interface
    /// set, then retry any requested interface still missing a socket
    fn reconcile(&mut self, available: HashMap<String, InterfaceInfo>) {
        let events = diff_interfaces(&self.available, &available);
        debug!(changes = events.len(), "Reconciling interfaces");
        for event in events {
            self.on_interface_change(event);
        }

        let mut missing: Vec<(&String, &InterfaceInfo)> = self
            .available
            .iter()
            .filter(|(name, _)| self.requested.contains(*name) && !self.sockets.contains(name))
            .collect();
        missing.sort_by(|a, b| a.0.cmp(b.0));
        for (name, info) in missing {
            self.sockets.create(name, *info);
        }
    }

    fn on_datagram(&mut self, datagram: Datagram) {
        let probe = match Probe::decode(&datagram.data) {
            Ok(probe) => probe,
            Err(e) => {
                trace!(interface = %datagram.if_name, source = %datagram.source, error = %e, "Dropped datagram");
                return;
            }
        };

        let event = self.state.registry.apply_probe(
            &probe,
            datagram.source.ip(),
            &datagram.if_name,
            Instant::now().into_std(),
            Utc::now(),
        );
        self.state.publish(event);
    }

    fn ping(&self, if_name: Option<&str>, target: Option<IpAddr>) {
        self.sockets.send(if_name, target, self.port, &self.probe);
    }

    fn scan(&mut self) {
        self.next_scan = None;
        if self.sockets.is_empty() {
            debug!("Scan skipped, no interface sockets");
        } else {
            self.ping(None, None);
        }

        let interval = self.schedule.next_interval();
        self.next_scan = Some(Instant::now() + interval);
        debug!(next_scan_ms = interval.as_millis() as u64, "Next scan scheduled");
    }

    fn expire(&mut self) {
        let events = self.state.registry.expire(Instant::now().into_std());
        self.state.publish(events);
    }

    fn teardown(&mut self) {
        self.next_scan = None;
        self.state.registry.teardown();
        self.sockets.teardown();
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
