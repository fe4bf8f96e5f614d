//! # lineboard-core — ordered line store for collaborative boards
//!
//! A board is an ordered collection of independently editable lines.
//! This crate holds the part with real invariants:
//!
//! - [`order`] — sparse 31-bit ordering keys that allow inserts between
//!   any two lines without renumbering
//! - [`line`] — line identity and last-write-wins content snapshots
//! - [`store`] — the in-memory store: merge, dirty tracking, focus
//! - [`authority`] — who mints new lines (remote vs. local)
//! - [`surface`] — render / preference collaborators
//!
//! Transport lives in `lineboard-collab`; nothing here is async-runtime
//! specific.

pub mod authority;
pub mod error;
pub mod line;
pub mod order;
pub mod store;
pub mod surface;

pub use authority::{LineAuthority, LocalAuthority, Placement};
pub use error::BoardError;
pub use line::{ContentSnapshot, ContentType, LineId, LineRecord};
pub use order::{OrderKey, OrderKeySpace, Position, DELETE_SENTINEL, EXPECTED_CAPACITY, MAX_KEY};
pub use store::{LineStore, MergeOutcome};
pub use surface::{MemoryPreferences, PreferenceStore, RenderSurface, StorageKeys};
