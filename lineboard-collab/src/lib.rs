//! # lineboard-collab — Networked editing for line boards
//!
//! Keeps a [`LineStore`](lineboard_core::LineStore) in sync with a relay
//! server over WebSocket, using one JSON text frame per line change.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   /board/{id}/socket   ┌──────────────┐
//! │ SyncChannel  │ ◄────────────────────► │  SyncServer  │
//! │ (per client) │      LineUpdate        │   (relay)    │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//! ┌──────┴───────┐   /board/{id}/line     ┌──────┴───────┐
//! │ BoardSession │ ─────────────────────► │  RelayBoard  │
//! │ + Remote-    │  create / delete line  │ (authority)  │
//! │   Authority  │                        └──────┬───────┘
//! └──────────────┘                               │
//!                                        ┌───────┴───────┐
//!                                        │ BroadcastGroup│
//!                                        │   (fan-out)   │
//!                                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and control requests
//! - [`channel`] — 40 ms flush loop with backpressure, inbound merge
//! - [`client`] — WebSocket transport for a channel
//! - [`authority`] — line creation and deletion through the relay
//! - [`session`] — per-line capability handles and user operations
//! - [`relay`] — server-side board state and key release
//! - [`broadcast`] — per-board fan-out
//! - [`server`] — WebSocket relay server

pub mod authority;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

pub use lineboard_core;

// Re-exports for convenience
pub use authority::{control_url, RemoteAuthority};
pub use broadcast::{BroadcastGroup, BroadcastStats, Relayed};
pub use channel::{
    ChannelConfig, ChannelEvent, ChannelStats, Outbound, SharedStore, SyncChannel,
    DEFAULT_FLUSH_INTERVAL,
};
pub use client::{connect, sync_url, SyncConnection, WsOutbound};
pub use protocol::{
    ControlRequest, CreateLineRequest, DeleteLineRequest, LineUpdate, ProtocolError,
};
pub use relay::{RelayBoard, RELAY_TAIL_STEP};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ActionFailure, BoardSession, LineAction, LineHandle};
