//! Strategies for minting new lines.
//!
//! A [`LineAuthority`] decides the identity and position of a new line.
//! In a networked board a remote authority answers (see the collab crate);
//! a standalone board uses [`LocalAuthority`], which allocates keys from an
//! [`OrderKeySpace`] and places the line at once.
//!
//! Authorities never see the store. They answer with a [`Placement`] which
//! the caller applies under its own lock, so a slow round-trip cannot hold
//! the store hostage:
//!
//! ```text
//!  caller ──► assign_and_insert ──► Placement { id, order }
//!                                        │
//!               order known ─────────────┼──► Placement::apply(store)
//!               order pending ───────────┴──► arrives as a store update
//! ```

use std::future::{ready, Future};

use crate::error::BoardError;
use crate::line::{ContentSnapshot, LineId};
use crate::order::{OrderKey, OrderKeySpace, Position};
use crate::store::{LineStore, MergeOutcome};

/// Where an authority put a new line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub id: LineId,
    /// `None` when the position reaches the store through a later update.
    pub order: Option<OrderKey>,
}

impl Placement {
    pub fn placed(id: LineId, order: OrderKey) -> Self {
        Self { id, order: Some(order) }
    }

    pub fn pending(id: LineId) -> Self {
        Self { id, order: None }
    }

    /// Insert the line into `store` if its key is known.
    pub fn apply(
        &self,
        store: &mut LineStore,
        snapshot: ContentSnapshot,
    ) -> Result<MergeOutcome, BoardError> {
        match self.order {
            Some(order) => {
                store.upsert_or_move(self.id.clone(), Some(Position::At(order)), Some(snapshot))
            }
            None => Ok(MergeOutcome::Ignored),
        }
    }
}

/// Capability to create and remove lines.
pub trait LineAuthority {
    /// Create a line after `parent` (after the last line when `None`).
    fn assign_and_insert(
        &mut self,
        parent: Option<LineId>,
        snapshot: ContentSnapshot,
    ) -> impl Future<Output = Result<Placement, BoardError>> + Send;

    /// Remove a line; resolves to whether the removal was accepted. The
    /// caller deletes accepted lines from its store.
    fn remove(&mut self, id: LineId) -> impl Future<Output = Result<bool, BoardError>> + Send;
}

/// Authority for a single-writer board with no round-trip.
#[derive(Debug, Default)]
pub struct LocalAuthority {
    space: OrderKeySpace,
    /// Keys handed out so far, ascending.
    keys: Vec<(OrderKey, LineId)>,
    next_id: u64,
}

impl LocalAuthority {
    pub fn new(space: OrderKeySpace) -> Self {
        Self {
            space,
            keys: Vec::new(),
            next_id: 0,
        }
    }

    /// Append each snapshot in turn, as when opening a saved board.
    pub fn seed(
        &mut self,
        store: &mut LineStore,
        snapshots: impl IntoIterator<Item = ContentSnapshot>,
    ) -> Result<Vec<LineId>, BoardError> {
        snapshots
            .into_iter()
            .map(|snapshot| self.insert_now(store, None, snapshot))
            .collect()
    }

    /// Reserve a key after `parent` without touching any store.
    pub fn assign(&mut self, parent: Option<&LineId>) -> Result<Placement, BoardError> {
        let (order, index) = self.allocate(parent)?;
        let id = LineId::Local(self.next_id);
        self.next_id += 1;
        self.keys.insert(index, (order, id.clone()));
        log::debug!("Local line {id} placed at {order}");
        Ok(Placement::placed(id, order))
    }

    /// Give up a line's key. The last remaining line is never released.
    pub fn release(&mut self, id: &LineId) -> bool {
        if self.keys.len() <= 1 {
            return false;
        }
        let Some(index) = self.keys.iter().position(|(_, held)| held == id) else {
            return false;
        };
        self.keys.remove(index);
        true
    }

    /// Assign and apply in one step.
    pub fn insert_now(
        &mut self,
        store: &mut LineStore,
        parent: Option<&LineId>,
        snapshot: ContentSnapshot,
    ) -> Result<LineId, BoardError> {
        let placement = self.assign(parent)?;
        if let Err(e) = placement.apply(store, snapshot) {
            self.forget(&placement.id);
            return Err(e);
        }
        Ok(placement.id)
    }

    /// Release and delete in one step.
    pub fn remove_now(&mut self, store: &mut LineStore, id: &LineId) -> Result<bool, BoardError> {
        if !self.release(id) {
            return Ok(false);
        }
        store.upsert_or_move(id.clone(), Some(Position::Delete), None)?;
        Ok(true)
    }

    fn forget(&mut self, id: &LineId) {
        self.keys.retain(|(_, held)| held != id);
    }

    /// Key for a line after `parent` and its index in `keys`.
    fn allocate(&self, parent: Option<&LineId>) -> Result<(OrderKey, usize), BoardError> {
        if self.keys.is_empty() {
            return Ok((self.space.first_key(), 0));
        }
        let anchor = match parent.filter(|p| !p.is_blank()) {
            Some(parent) => self
                .keys
                .iter()
                .position(|(_, id)| id == parent)
                .ok_or_else(|| BoardError::LineNotFound(parent.clone()))?,
            None => self.keys.len() - 1,
        };
        let lower = self.keys[anchor].0;
        let order = match self.keys.get(anchor + 1) {
            None => self.space.next_key(lower)?,
            Some((upper, _)) => self.space.split_key(lower, *upper)?,
        };
        Ok((order, anchor + 1))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl LineAuthority for LocalAuthority {
    fn assign_and_insert(
        &mut self,
        parent: Option<LineId>,
        _snapshot: ContentSnapshot,
    ) -> impl Future<Output = Result<Placement, BoardError>> + Send {
        ready(self.assign(parent.as_ref()))
    }

    fn remove(&mut self, id: LineId) -> impl Future<Output = Result<bool, BoardError>> + Send {
        ready(Ok(self.release(&id)))
    }
}
