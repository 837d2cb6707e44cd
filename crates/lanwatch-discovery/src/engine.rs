//! Discovery engine handle
//!
//! [`LanDiscovery`] is the public face of the engine. It watches the
//! interface provider, starts and stops the background worker, and forwards
//! queries to it. While stopped, queries are answered from the state the
//! last worker left behind.

use lanwatch_core::{DeviceId, LanDeviceInfo};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::LanConfig;
use crate::error::{DiscoveryError, Result};
use crate::interfaces::{InterfaceEvent, InterfaceInfo, InterfaceProvider};
use crate::subscribers::spawn_dispatcher;
use crate::worker::{Command, Parked, WorkerHandle};

enum EngineState {
    Stopped(Parked),
    Running(WorkerHandle),
}

struct Inner {
    config: LanConfig,
    requested: HashSet<String>,
    virtual_id: u64,
    provider: Arc<dyn InterfaceProvider>,
    runtime: Handle,
    state: Mutex<EngineState>,
    watching: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let EngineState::Running(worker) = self.state.get_mut() {
            worker.signal_shutdown();
        }
    }
}

/// LAN device discovery engine
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct LanDiscovery {
    inner: Arc<Inner>,
}

impl LanDiscovery {
    /// Create a stopped engine. Must be called from within a tokio runtime;
    /// subscriber handlers run on that runtime.
    pub fn new(config: LanConfig, provider: Arc<dyn InterfaceProvider>) -> Self {
        Self::with_runtime(config, provider, Handle::current())
    }

    /// Create a stopped engine whose subscriber handlers run on `runtime`
    pub fn with_runtime(
        config: LanConfig,
        provider: Arc<dyn InterfaceProvider>,
        runtime: Handle,
    ) -> Self {
        let virtual_id = config.virtual_id.unwrap_or_else(rand::random);
        let requested = config.interfaces.iter().cloned().collect();
        debug!(virtual_id, interfaces = ?config.interfaces, "Discovery engine created");

        Self {
            inner: Arc::new(Inner {
                config,
                requested,
                virtual_id,
                provider,
                runtime,
                state: Mutex::new(EngineState::Stopped(Parked::default())),
                watching: AtomicBool::new(false),
            }),
        }
    }

    /// Identity carried in outbound probes
    pub fn virtual_id(&self) -> u64 {
        self.inner.virtual_id
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock().await, EngineState::Running(_))
    }

    /// Start discovery on the requested interfaces that are available.
    ///
    /// Always registers for interface changes, so an engine started with no
    /// usable interface comes up by itself once one appears. Returns after
    /// half the minimum scan interval when the worker was started, giving
    /// the first scan a chance to collect replies.
    pub async fn init(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            self.watch_interfaces();

            if matches!(*state, EngineState::Running(_)) {
                info!("Discovery already running");
                return Ok(());
            }
            let Some(available) = self.usable_interfaces() else {
                return Ok(());
            };

            let EngineState::Stopped(parked) = &mut *state else {
                return Ok(());
            };
            let worker = WorkerHandle::start(
                &self.inner.config,
                self.inner.virtual_id,
                self.inner.requested.clone(),
                available,
                std::mem::take(parked),
            )?;
            *state = EngineState::Running(worker);
            info!(
                interfaces = ?self.inner.config.interfaces,
                virtual_id = self.inner.virtual_id,
                "LAN discovery started"
            );
        }

        tokio::time::sleep(self.inner.config.probe_interval_min() / 2).await;
        Ok(())
    }

    /// Stop discovery, forgetting every device and subscriber
    pub async fn deinit(&self) -> Result<()> {
        self.stop(false).await
    }

    /// Snapshot of every known device keyed by id
    pub async fn list_devices(&self) -> Result<HashMap<String, LanDeviceInfo>> {
        self.request(
            |done| Command::ListDevices { done },
            |parked| parked.registry.snapshot(),
        )
        .await
    }

    /// Register `handler` under `key`, replacing any handler already there.
    ///
    /// The handler receives every later online/offline/address change along
    /// with a clone of `context`. Calls for one subscriber never overlap.
    pub async fn subscribe<F, Fut, C>(&self, key: &str, handler: F, context: C) -> Result<()>
    where
        F: Fn(LanDeviceInfo, C) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: Clone + Send + 'static,
    {
        let sender = spawn_dispatcher(&self.inner.runtime, handler, context);
        let key = key.to_string();
        let parked_key = key.clone();
        let parked_sender = sender.clone();
        self.request(
            |done| Command::Subscribe { key, sender, done },
            move |parked| parked.subscribers.insert(parked_key, parked_sender),
        )
        .await
    }

    pub async fn unsubscribe(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        let parked_key = key.clone();
        self.request(
            |done| Command::Unsubscribe { key, done },
            move |parked| parked.subscribers.remove(&parked_key),
        )
        .await
    }

    /// Send one probe. `if_name` limits it to one interface, `target` sends
    /// unicast instead of broadcast. Does nothing while stopped.
    pub async fn ping(&self, if_name: Option<&str>, target: Option<IpAddr>) -> Result<()> {
        let if_name = if_name.map(str::to_string);
        self.request(
            |done| Command::Ping {
                if_name,
                target,
                done,
            },
            |_| debug!("Ping ignored, discovery not running"),
        )
        .await
    }

    /// Override a device's online flag. Returns whether the device is known.
    pub async fn set_device_online(&self, id: &DeviceId, online: bool) -> Result<bool> {
        let parked_id = id.clone();
        let id = id.clone();
        self.request(
            |done| Command::SetOnline { id, online, done },
            move |parked| parked.set_online(&parked_id, online),
        )
        .await
    }

    /// Override a device's address. Returns whether the device is known.
    pub async fn set_device_ip(&self, id: &DeviceId, ip: Option<IpAddr>) -> Result<bool> {
        let parked_id = id.clone();
        let id = id.clone();
        self.request(
            |done| Command::SetIp { id, ip, done },
            move |parked| parked.set_ip(&parked_id, ip),
        )
        .await
    }

    /// Local port shared by the interface sockets, once one is bound
    pub async fn local_port(&self) -> Result<Option<u16>> {
        self.request(|done| Command::LocalPort { done }, |_| None).await
    }

    /// Run `command` on the worker, or `stopped` against the parked state
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
        stopped: impl FnOnce(&mut Parked) -> T,
    ) -> Result<T> {
        let (done, reply) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            match &mut *state {
                EngineState::Stopped(parked) => return Ok(stopped(parked)),
                EngineState::Running(worker) => worker.send(command(done))?,
            }
        }
        reply.await.map_err(|_| DiscoveryError::WorkerStopped)
    }

    /// Requested interfaces that are currently available, or `None` when
    /// there is nothing to run on
    fn usable_interfaces(&self) -> Option<HashMap<String, InterfaceInfo>> {
        if self.inner.requested.is_empty() {
            info!("No interfaces requested");
            return None;
        }
        let available = self.inner.provider.interfaces();
        if available.is_empty() {
            info!("No network interfaces available");
            return None;
        }
        if !available.keys().any(|name| self.inner.requested.contains(name)) {
            info!(
                requested = ?self.inner.config.interfaces,
                available = ?available.keys().collect::<Vec<_>>(),
                "None of the requested interfaces is available"
            );
            return None;
        }
        Some(available)
    }

    /// Stop the worker. With `retain` the registry and subscribers are kept
    /// for the next start.
    async fn stop(&self, retain: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let worker = match std::mem::replace(&mut *state, EngineState::Stopped(Parked::default())) {
            EngineState::Running(worker) => worker,
            stopped => {
                *state = stopped;
                debug!("Discovery not running");
                return Ok(());
            }
        };

        let parked = worker.shutdown().await?;
        if retain {
            *state = EngineState::Stopped(parked);
            info!("LAN discovery suspended");
        } else {
            info!("LAN discovery stopped");
        }
        Ok(())
    }

    /// Start the interface watcher once per engine
    fn watch_interfaces(&self) {
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.inner.provider.subscribe();
        let engine = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(watch_loop(engine, events));
    }

    async fn on_interface_change(&self, event: InterfaceEvent) -> Result<()> {
        info!(interface = %event.name, status = ?event.status, ip = %event.info.ip, "Network interface changed");

        if self.settle_lifecycle().await? {
            self.request(|done| Command::Interface { event, done }, |_| ()).await?;
        }
        Ok(())
    }

    /// Rebuild the socket set from a full snapshot after change events
    /// were dropped
    async fn resync(&self) -> Result<()> {
        if self.settle_lifecycle().await? {
            let available = self.inner.provider.interfaces();
            self.request(|done| Command::Reconcile { available, done }, |_| ()).await?;
        }
        Ok(())
    }

    /// Stop when nothing usable is left, start when something usable
    /// appeared. Returns true when a worker was already running and still
    /// has to hear about the change.
    async fn settle_lifecycle(&self) -> Result<bool> {
        if self.usable_interfaces().is_none() {
            self.stop(true).await?;
            return Ok(false);
        }
        if !self.is_running().await {
            self.init().await?;
            return Ok(false);
        }
        Ok(true)
    }
}

async fn watch_loop(engine: Weak<Inner>, mut events: broadcast::Receiver<InterfaceEvent>) {
    loop {
        let received = events.recv().await;
        if matches!(received, Err(broadcast::error::RecvError::Closed)) {
            break;
        }
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = LanDiscovery { inner };

        let outcome = match received {
            Ok(event) => engine.on_interface_change(event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Interface watcher lagged, resyncing");
                engine.resync().await
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Err(e) = outcome {
            error!(error = %e, "Failed to apply interface change");
        }
    }
    debug!("Interface watcher exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::ManualInterfaces;
    use std::net::Ipv4Addr;

    fn config(interfaces: &[&str]) -> LanConfig {
        LanConfig {
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            probe_interval_min_ms: 20,
            probe_interval_max_ms: 40,
            startup_jitter_ms: 0,
            ..LanConfig::default()
        }
    }

    fn loopback() -> InterfaceInfo {
        InterfaceInfo::new(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0))
    }

    #[tokio::test]
    async fn test_init_without_requested_interfaces_stays_stopped() {
        let provider = ManualInterfaces::new();
        provider.add("test0", loopback());
        let engine = LanDiscovery::new(config(&[]), provider);

        engine.init().await.unwrap();
        assert!(!engine.is_running().await);
        assert!(engine.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_with_disjoint_interfaces_stays_stopped() {
        let provider = ManualInterfaces::new();
        provider.add("test1", loopback());
        let engine = LanDiscovery::new(config(&["test0"]), provider);

        engine.init().await.unwrap();
        assert!(!engine.is_running().await);
        assert_eq!(engine.local_port().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_deinit_stops() {
        let provider = ManualInterfaces::new();
        provider.add("test0", loopback());
        let engine = LanDiscovery::new(config(&["test0"]), provider);

        engine.init().await.unwrap();
        let port = engine.local_port().await.unwrap();
        assert!(port.is_some());

        engine.init().await.unwrap();
        assert!(engine.is_running().await);
        assert_eq!(engine.local_port().await.unwrap(), port);

        engine.deinit().await.unwrap();
        assert!(!engine.is_running().await);
        engine.deinit().await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_virtual_id() {
        let provider = ManualInterfaces::new();
        let engine = LanDiscovery::new(
            LanConfig {
                virtual_id: Some(42),
                ..LanConfig::default()
            },
            provider,
        );
        assert_eq!(engine.virtual_id(), 42);
        assert_eq!(engine.clone().virtual_id(), 42);
    }

    #[tokio::test]
    async fn test_subscribe_while_stopped_survives_start() {
        let provider = ManualInterfaces::new();
        provider.add("test0", loopback());
        let engine = LanDiscovery::new(config(&["test0"]), provider);

        engine
            .subscribe("early", |_event: LanDeviceInfo, _: ()| async {}, ())
            .await
            .unwrap();
        engine.init().await.unwrap();

        let mut state = engine.inner.state.lock().await;
        assert!(matches!(*state, EngineState::Running(_)));
        drop(state);

        engine.deinit().await.unwrap();
        state = engine.inner.state.lock().await;
        let EngineState::Stopped(parked) = &*state else {
            panic!("engine still running");
        };
        assert!(parked.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_overrides() {
        let provider = ManualInterfaces::new();
        let engine = LanDiscovery::new(config(&["test0"]), provider);
        let id = DeviceId::from("1");
        assert!(!engine.set_device_online(&id, true).await.unwrap());
        assert!(!engine.set_device_ip(&id, None).await.unwrap());
        engine.ping(None, None).await.unwrap();
    }
}
