//! Keyed change subscribers
//!
//! The worker only holds a channel per subscriber. Each subscriber's handler
//! runs in its own dispatcher task on the caller's runtime, so handlers never
//! run on the worker thread, events reach one subscriber in the order they
//! were raised, and a slow or failed subscriber does not hold up the others.

use lanwatch_core::LanDeviceInfo;
use std::collections::HashMap;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type EventSender = mpsc::UnboundedSender<LanDeviceInfo>;

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: HashMap<String, EventSender>,
}

impl SubscriberRegistry {
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.subscribers.contains_key(key)
    }

    /// Register `sender` under `key`, replacing any previous entry
    pub fn insert(&mut self, key: String, sender: EventSender) {
        if self.subscribers.insert(key.clone(), sender).is_some() {
            info!(key = %key, "Replaced device status subscriber");
        } else {
            debug!(key = %key, "Registered device status subscriber");
        }
    }

    pub fn remove(&mut self, key: &str) {
        if self.subscribers.remove(key).is_some() {
            debug!(key = %key, "Unregistered device status subscriber");
        }
    }

    /// Hand `event` to every subscriber; dispatchers that went away are dropped
    pub fn notify(&mut self, event: &LanDeviceInfo) {
        self.subscribers.retain(|key, sender| {
            let delivered = sender.send(event.clone()).is_ok();
            if !delivered {
                debug!(key = %key, device = %event.id, "Subscriber dispatcher gone, dropping it");
            }
            delivered
        });
    }
}

/// Start a dispatcher on `runtime` calling `handler(event, context)` for each
/// event, one at a time. The dispatcher ends once the returned sender and
/// every clone of it are dropped.
pub fn spawn_dispatcher<F, Fut, C>(runtime: &Handle, handler: F, context: C) -> EventSender
where
    F: Fn(LanDeviceInfo, C) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    C: Clone + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<LanDeviceInfo>();
    runtime.spawn(async move {
        while let Some(event) = rx.recv().await {
            handler(event, context.clone()).await;
        }
    });
    tx
}
