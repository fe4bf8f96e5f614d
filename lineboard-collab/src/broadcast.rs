//! Fan-out of line updates to every sync connection of a board.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each
//! with its own buffer of `capacity` frames. A receiver that falls further
//! behind loses the oldest frames (reported as lag) instead of slowing
//! the board down.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One encoded frame on its way to the connections of a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    /// Connection the update came from; `None` for server-originated
    /// frames, which go to everyone.
    pub origin: Option<Uuid>,
    pub text: Arc<str>,
}

impl Relayed {
    /// Whether `connection` should receive this frame.
    pub fn is_for(&self, connection: Uuid) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group of a single board.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Relayed>,
    connections: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per connection.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection unless the group already holds `limit`.
    pub async fn join(&self, connection: Uuid, limit: usize) -> Option<broadcast::Receiver<Relayed>> {
        let mut connections = self.connections.write().await;
        if connections.len() >= limit {
            return None;
        }
        connections.insert(connection);
        Some(self.sender.subscribe())
    }

    pub async fn leave(&self, connection: &Uuid) -> bool {
        self.connections.write().await.remove(connection)
    }

    /// Send a frame to every subscriber. Returns how many received it.
    pub fn broadcast(&self, origin: Option<Uuid>, text: impl Into<Arc<str>>) -> usize {
        let frame = Relayed {
            origin,
            text: text.into(),
        };
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn has_connection(&self, connection: &Uuid) -> bool {
        self.connections.read().await.contains(connection)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let connections = self.connections.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: connections.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
