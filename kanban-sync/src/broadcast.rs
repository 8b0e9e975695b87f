//! Connection registry and broadcast fanout.
//!
//! Each live connection owns a bounded outbox (an mpsc channel of
//! pre-serialized frames) drained by its socket task. The registry maps
//! connection handles to outboxes; the fanout serializes an event once and
//! pushes the frame into every outbox except an optional excluded one.
//!
//! Delivery never blocks: a full or closed outbox is a per-connection
//! failure that is logged and counted while the rest still receive the frame.
//! A connection that missed a frame is evicted from the registry. Dropping its
//! outbox ends its socket task, and the client resyncs when it reconnects.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Event, ProtocolError};

/// Handle identifying one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a frame did not reach an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbox full")]
    Full,
    #[error("outbox closed")]
    Closed,
}

/// Sending half of a connection's outbox.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::Sender<Arc<str>>,
}

impl Outbox {
    /// Create an outbox buffering up to `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The set of live connections.
///
/// Mutation of the member set and iteration over it are mutually exclusive.
pub trait Registry: Send + Sync {
    fn register(&self, outbox: Outbox) -> ConnectionId;
    /// Returns `false` if the handle was not registered.
    fn unregister(&self, id: ConnectionId) -> bool;
    /// Visit every connection except `excluding`.
    fn for_each(&self, excluding: Option<ConnectionId>, visit: &mut dyn FnMut(ConnectionId, &Outbox));
    fn get(&self, id: ConnectionId) -> Option<Outbox>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutex-guarded map of connection handles to outboxes.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    members: Mutex<HashMap<ConnectionId, Outbox>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<ConnectionId, Outbox>> {
        // Members are plain handles; a panic mid-iteration leaves the map intact.
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Registry for ConnectionRegistry {
    fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::new();
        self.members().insert(id, outbox);
        id
    }

    fn unregister(&self, id: ConnectionId) -> bool {
        self.members().remove(&id).is_some()
    }

    fn for_each(&self, excluding: Option<ConnectionId>, visit: &mut dyn FnMut(ConnectionId, &Outbox)) {
        let members = self.members();
        for (id, outbox) in members.iter() {
            if Some(*id) != excluding {
                visit(*id, outbox);
            }
        }
    }

    fn get(&self, id: ConnectionId) -> Option<Outbox> {
        self.members().get(&id).cloned()
    }

    fn len(&self) -> usize {
        self.members().len()
    }
}

/// Snapshot of fanout counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Events serialized and handed to the fanout
    pub messages_sent: u64,
    /// Frames accepted by an outbox
    pub deliveries: u64,
    /// Frames rejected by a full or closed outbox
    pub failed_deliveries: u64,
    /// Connections dropped from the registry after a failed delivery
    pub evictions: u64,
}

/// Lock-free counters behind [`FanoutStats`].
#[derive(Debug, Default)]
struct AtomicFanoutStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// Delivers events to registered connections.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<dyn Registry>,
    stats: Arc<AtomicFanoutStats>,
}

impl Fanout {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicFanoutStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Deliver `event` to every connection except `excluding`.
    ///
    /// Returns the number of connections that accepted the frame.
    pub fn broadcast(&self, event: &Event, excluding: Option<ConnectionId>) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(event.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut lagging = Vec::new();
        self.registry.for_each(excluding, &mut |id, outbox| match outbox.deliver(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                log::warn!("Dropped {} for connection {id}: {e}", event.name());
                lagging.push(id);
            }
        });

        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.failed_deliveries.fetch_add(lagging.len() as u64, Ordering::Relaxed);
        // The registry lock is released; evicting inside `for_each` would deadlock.
        for id in lagging {
            self.evict(id);
        }
        log::debug!("Broadcast {} to {delivered} connections", event.name());
        Ok(delivered)
    }

    /// Deliver `event` to a single connection. Returns whether it was accepted.
    pub fn send_to(&self, id: ConnectionId, event: &Event) -> Result<bool, ProtocolError> {
        let frame: Arc<str> = Arc::from(event.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let Some(outbox) = self.registry.get(id) else {
            log::debug!("Reply {} for unregistered connection {id}", event.name());
            return Ok(false);
        };
        match outbox.deliver(frame) {
            Ok(()) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropped {} for connection {id}: {e}", event.name());
                drop(outbox);
                self.evict(id);
                Ok(false)
            }
        }
    }

    /// Remove a connection that can no longer be kept in sync.
    fn evict(&self, id: ConnectionId) {
        if self.registry.unregister(id) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            log::warn!("Evicted connection {id} after a missed frame");
        }
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}
