//! Subscription hub: browser SSE clients and their per-instance subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

/// First frame sent on every browser stream.
pub const CONNECTED_FRAME: &str = "data: {\"type\":\"connected\",\"message\":\"connected\"}\n\n";

/// Per-client send buffer (frames, not bytes).
const DEFAULT_CLIENT_BUFFER: usize = 64;

type Sink = mpsc::Sender<String>;

#[derive(Default)]
struct HubInner {
    /// All attached browser clients.
    clients: HashMap<String, Sink>,
    /// Instance ID -> subscribed clients.
    subs_by_instance: HashMap<String, HashMap<String, Sink>>,
    /// Client ID -> instances it subscribes to. Makes detach O(k) in the
    /// client's own subscriptions.
    subs_by_client: HashMap<String, HashSet<String>>,
}

/// Registry of browser SSE clients with per-instance fan-out.
///
/// Both maps live behind a single reader-writer lock. Publishing snapshots
/// the subscriber set under the read lock, performs all channel writes with
/// no lock held, then evicts dead clients under the write lock. A client
/// subscribed when a publish begins either observes the event or is evicted
/// by the end of the call.
pub struct SseHub {
    inner: RwLock<HubInner>,
    buffer: usize,
}

impl SseHub {
    /// Create a hub with the given per-client frame buffer.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
            buffer: if buffer == 0 {
                DEFAULT_CLIENT_BUFFER
            } else {
                buffer
            },
        }
    }

    /// Attach a browser client; returns the receiving side of its sink.
    pub fn attach(&self, client_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.inner.write().unwrap();
        inner.clients.insert(client_id.to_string(), tx);
        info!(
            "sse client {} attached ({} total)",
            client_id,
            inner.clients.len()
        );
        rx
    }

    /// Detach a client and drop all of its subscriptions.
    pub fn detach(&self, client_id: &str) {
        let mut inner = self.inner.write().unwrap();
        detach_locked(&mut inner, client_id);
        info!(
            "sse client {} detached ({} remaining)",
            client_id,
            inner.clients.len()
        );
    }

    /// Subscribe a client to one instance's events. Returns false when the
    /// client is not attached.
    pub fn subscribe(&self, client_id: &str, instance_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(sink) = inner.clients.get(client_id).cloned() else {
            return false;
        };
        inner
            .subs_by_instance
            .entry(instance_id.to_string())
            .or_default()
            .insert(client_id.to_string(), sink);
        inner
            .subs_by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
        debug!("sse client {} subscribed to instance {}", client_id, instance_id);
        true
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, client_id: &str, instance_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(subs) = inner.subs_by_instance.get_mut(instance_id) {
            subs.remove(client_id);
            if subs.is_empty() {
                inner.subs_by_instance.remove(instance_id);
            }
        }
        if let Some(instances) = inner.subs_by_client.get_mut(client_id) {
            instances.remove(instance_id);
            if instances.is_empty() {
                inner.subs_by_client.remove(client_id);
            }
        }
    }

    /// Publish an event to every subscriber of one instance.
    ///
    /// Returns the number of clients the frame was delivered to.
    pub fn publish_instance(&self, instance_id: &str, payload: &impl Serialize) -> usize {
        // Serialize once, before taking any lock.
        let frame = match encode_frame(payload) {
            Some(frame) => frame,
            None => return 0,
        };

        let targets: Vec<(String, Sink)> = {
            let inner = self.inner.read().unwrap();
            match inner.subs_by_instance.get(instance_id) {
                Some(subs) => subs
                    .iter()
                    .map(|(id, sink)| (id.clone(), sink.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let (sent, dead) = deliver(&targets, &frame);

        if !dead.is_empty() {
            let mut inner = self.inner.write().unwrap();
            for client_id in &dead {
                if let Some(subs) = inner.subs_by_instance.get_mut(instance_id) {
                    subs.remove(client_id);
                    if subs.is_empty() {
                        inner.subs_by_instance.remove(instance_id);
                    }
                }
                if let Some(instances) = inner.subs_by_client.get_mut(client_id) {
                    instances.remove(instance_id);
                    if instances.is_empty() {
                        inner.subs_by_client.remove(client_id);
                    }
                }
            }
            warn!(
                "evicted {} dead subscriber(s) from instance {}",
                dead.len(),
                instance_id
            );
        }

        sent
    }

    /// Publish an event to every attached client (global stream).
    pub fn publish_global(&self, payload: &impl Serialize) -> usize {
        let frame = match encode_frame(payload) {
            Some(frame) => frame,
            None => return 0,
        };

        let targets: Vec<(String, Sink)> = {
            let inner = self.inner.read().unwrap();
            inner
                .clients
                .iter()
                .map(|(id, sink)| (id.clone(), sink.clone()))
                .collect()
        };

        let (sent, dead) = deliver(&targets, &frame);

        if !dead.is_empty() {
            let mut inner = self.inner.write().unwrap();
            for client_id in &dead {
                detach_locked(&mut inner, client_id);
            }
            warn!("evicted {} dead client(s)", dead.len());
        }

        sent
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.inner.read().unwrap().clients.len()
    }

    /// Number of subscribers for one instance.
    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .subs_by_instance
            .get(instance_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_BUFFER)
    }
}

fn encode_frame(payload: &impl Serialize) -> Option<String> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(format!("data: {}\n\n", json)),
        Err(err) => {
            warn!("failed to serialize sse payload: {err}");
            None
        }
    }
}

/// Write a frame to every target without holding the hub lock.
///
/// A closed channel marks the client dead; a full one only costs that client
/// this frame (a reconnecting browser re-reads current state anyway).
fn deliver(targets: &[(String, Sink)], frame: &str) -> (usize, Vec<String>) {
    let mut sent = 0usize;
    let mut dead = Vec::new();
    for (client_id, sink) in targets {
        match sink.try_send(frame.to_string()) {
            Ok(()) => sent += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("sse client {} is slow, dropping frame", client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                dead.push(client_id.clone());
            }
        }
    }
    (sent, dead)
}

fn detach_locked(inner: &mut HubInner, client_id: &str) {
    inner.clients.remove(client_id);
    if let Some(instances) = inner.subs_by_client.remove(client_id) {
        for instance_id in instances {
            if let Some(subs) = inner.subs_by_instance.get_mut(&instance_id) {
                subs.remove(client_id);
                if subs.is_empty() {
                    inner.subs_by_instance.remove(&instance_id);
                }
            }
        }
    }
}
