//! Transport-agnostic synchronisation channel.
//!
//! ```text
//!            every 40 ms                          per text frame
//! LineStore ─────────────► flush_tick ──► Outbound ─────────────► peer
//!     ▲                    (skipped while the outbound buffer
//!     │                     still holds a previous batch)
//!     └──────── handle_inbound ◄──────────────────────────────── peer
//! ```
//!
//! Backpressure is cooperative: a slow peer causes skipped ticks, never a
//! growing queue. Inbound messages that fail to parse or to merge are
//! logged and dropped; the channel keeps running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lineboard_core::{LineId, LineStore, MergeOutcome};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{LineUpdate, ProtocolError};

/// Store handle shared by the channel, the session and the transport tasks.
pub type SharedStore = Arc<Mutex<LineStore>>;

/// Default flush cadence (25 Hz).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(40);

/// Outgoing half of a duplex transport.
pub trait Outbound: Send + Sync {
    /// Bytes handed to [`send`](Self::send) that have not been written yet.
    fn buffered_amount(&self) -> usize;

    /// Queue one text frame. Must not block.
    fn send(&self, text: String) -> Result<(), ProtocolError>;

    /// True once the transport can no longer deliver frames.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub flush_interval: Duration,
    /// Capacity of the connection event queue.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            event_capacity: 256,
        }
    }
}

/// Events the surrounding application may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// The peer completed the closing handshake.
    ClosedCleanly { code: u16, reason: String },
    /// The connection dropped without a closing handshake.
    ClosedAbnormally { reason: String },
    TransportError(String),
    /// A remote update was merged into the store.
    RemoteApplied { id: LineId, outcome: MergeOutcome },
}

/// Counters for monitoring a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub updates_sent: u64,
    pub ticks_skipped: u64,
    pub inbound_applied: u64,
    pub inbound_discarded: u64,
}

#[derive(Default)]
struct AtomicChannelStats {
    updates_sent: AtomicU64,
    ticks_skipped: AtomicU64,
    inbound_applied: AtomicU64,
    inbound_discarded: AtomicU64,
}

/// Moves dirty lines out and merges remote lines in.
pub struct SyncChannel<T: Outbound> {
    store: SharedStore,
    outbound: T,
    config: ChannelConfig,
    event_tx: mpsc::Sender<ChannelEvent>,
    stats: AtomicChannelStats,
}

impl<T: Outbound> SyncChannel<T> {
    /// Create a channel and the receiver for its events.
    pub fn new(
        store: SharedStore,
        outbound: T,
        config: ChannelConfig,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let channel = Self {
            store,
            outbound,
            config,
            event_tx,
            stats: AtomicChannelStats::default(),
        };
        (channel, event_rx)
    }

    /// Send every dirty line, one frame per line.
    ///
    /// Returns the number of frames sent; zero when the outbound buffer is
    /// still draining. A send failure is reported as a
    /// [`ChannelEvent::TransportError`] and returned; the lines drained in
    /// that tick are not retried. A closed outbound fails the tick before
    /// anything is drained.
    pub async fn flush_tick(&self) -> Result<usize, ProtocolError> {
        if self.outbound.is_closed() {
            log::debug!("Outbound closed, not flushing");
            return Err(ProtocolError::ConnectionClosed);
        }
        let buffered = self.outbound.buffered_amount();
        if buffered > 0 {
            self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            log::trace!("Skipping flush, {buffered} bytes still buffered");
            return Ok(0);
        }

        let changes = self.store.lock().await.drain_changes();
        let mut sent = 0;
        for (id, snapshot) in changes {
            let text = match LineUpdate::content(id, snapshot).encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode line update: {e}");
                    continue;
                }
            };
            if let Err(e) = self.outbound.send(text) {
                log::error!("Failed to send line update: {e}");
                self.emit(ChannelEvent::TransportError(e.to_string()));
                return Err(e);
            }
            sent += 1;
        }
        if sent > 0 {
            self.stats.updates_sent.fetch_add(sent as u64, Ordering::Relaxed);
            log::debug!("Flushed {sent} line updates");
        }
        Ok(sent)
    }

    /// Parse and merge one inbound frame. Never fails: bad frames are
    /// logged and discarded.
    pub async fn handle_inbound(&self, text: &str) -> Option<MergeOutcome> {
        let update = match LineUpdate::decode(text) {
            Ok(update) => update,
            Err(e) => {
                self.stats.inbound_discarded.fetch_add(1, Ordering::Relaxed);
                log::warn!("Discarding inbound message {text:?}: {e}");
                return None;
            }
        };

        let result = {
            let mut store = self.store.lock().await;
            update.apply_to(&mut store)
        };
        match result {
            Ok(outcome) => {
                self.stats.inbound_applied.fetch_add(1, Ordering::Relaxed);
                self.emit(ChannelEvent::RemoteApplied {
                    id: update.id,
                    outcome,
                });
                Some(outcome)
            }
            Err(e) => {
                self.stats.inbound_discarded.fetch_add(1, Ordering::Relaxed);
                log::error!("Error applying update '{text}': {e}");
                None
            }
        }
    }

    /// Run [`flush_tick`](Self::flush_tick) on the configured interval until
    /// a send fails or the task is aborted.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()>
    where
        T: 'static,
    {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(channel.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if channel.flush_tick().await.is_err() {
                    log::warn!("Flush loop stopped after transport failure");
                    break;
                }
            }
        })
    }

    /// Publish an event without waiting; dropped with a warning when the
    /// queue is full.
    pub fn emit(&self, event: ChannelEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event queue full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn outbound(&self) -> &T {
        &self.outbound
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            updates_sent: self.stats.updates_sent.load(Ordering::Relaxed),
            ticks_skipped: self.stats.ticks_skipped.load(Ordering::Relaxed),
            inbound_applied: self.stats.inbound_applied.load(Ordering::Relaxed),
            inbound_discarded: self.stats.inbound_discarded.load(Ordering::Relaxed),
        }
    }
}
