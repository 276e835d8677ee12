//! # Hub Dispatcher
//!
//! Fans hub events out to every connected subscriber.
//!
//! A broadcast encodes the event into a frame once and wraps the bytes in an
//! `Arc`; every subscriber queue receives a pointer to the same buffer.
//! Queues are unbounded, so a broadcast never waits on a slow subscriber.
//! A subscriber whose receiving half was dropped is pruned on the next
//! broadcast; a failure to reach one subscriber never affects the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;

use crate::protocol::{HubEvent, HubFrame};

/// An encoded frame shared by all subscribers it is delivered to.
pub type SharedFrame = Arc<Bytes>;

/// Receiving half handed to a subscriber session.
pub type ClientReceiver = mpsc::UnboundedReceiver<SharedFrame>;

/// Destination of the broadcast pipeline.
pub trait FanOutSink: Send + Sync {
    fn broadcast(&self, event: HubEvent);
}

struct ClientHandle {
    id: u64,
    sender: mpsc::UnboundedSender<SharedFrame>,
}

pub struct Dispatcher {
    clients: Mutex<Vec<ClientHandle>>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber and returns its id and queue.
    pub fn add_client(&self) -> (u64, ClientReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.lock();
        clients.push(ClientHandle { id, sender: tx });
        tracing::info!(client_id = id, total = clients.len(), "Subscriber registered");
        (id, rx)
    }

    pub fn remove_client(&self, id: u64) {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|c| c.id != id);
        if clients.len() != before {
            tracing::info!(client_id = id, total = clients.len(), "Subscriber removed");
        }
    }

    /// Sends a frame to one subscriber only. False when it is gone.
    pub fn send_to(&self, id: u64, frame: &HubFrame) -> bool {
        let bytes = Arc::new(Bytes::from(frame.encode_to_vec()));
        let clients = self.lock();
        clients
            .iter()
            .find(|c| c.id == id)
            .is_some_and(|c| c.sender.send(bytes).is_ok())
    }

    /// Encodes the frame once and queues it for every subscriber.
    pub fn broadcast_frame(&self, frame: &HubFrame) {
        let bytes = Arc::new(Bytes::from(frame.encode_to_vec()));
        let mut clients = self.lock();
        clients.retain(|client| match client.sender.send(Arc::clone(&bytes)) {
            Ok(()) => true,
            Err(_) => {
                tracing::info!(client_id = client.id, "Subscriber disconnected, removing from dispatcher");
                false
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops every queue, which ends every subscriber session.
    pub fn disconnect_all(&self) {
        let mut clients = self.lock();
        if !clients.is_empty() {
            tracing::info!(total = clients.len(), "Disconnecting all subscribers");
        }
        clients.clear();
    }
}

impl FanOutSink for Dispatcher {
    fn broadcast(&self, event: HubEvent) {
        tracing::debug!(target_event = event.target(), "Broadcasting hub event");
        self.broadcast_frame(&event.into_frame());
    }
}
