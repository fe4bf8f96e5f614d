//! Server-side board state: the remote authority's view of a board.
//!
//! Creation places a line after its parent with a "release space" rule:
//!
//! ```text
//! parent ── gap > 1 ──► parent + gap·2/3
//! parent ── no successor ──► parent + 65536
//! parent ── gap == 1 ──► push the successor forward (and any run of
//!                        adjacent keys behind it), then split the
//!                        widened gap
//! ```
//!
//! Every line moved by the cascade is reported so it can be broadcast.

use lineboard_core::{
    BoardError, ContentSnapshot, ContentType, LineId, LineStore, MergeOutcome, OrderKey,
    OrderKeySpace, Position,
};
use uuid::Uuid;

use crate::protocol::LineUpdate;

/// Step between a tail line and the one appended after it.
pub const RELAY_TAIL_STEP: OrderKey = 65_536;

/// One board held by the relay.
#[derive(Debug)]
pub struct RelayBoard {
    store: LineStore,
    tail: OrderKeySpace,
}

impl Default for RelayBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBoard {
    /// A board with a single empty line at key 0.
    pub fn new() -> Self {
        Self {
            store: LineStore::with_first_line(
                new_line_id(),
                0,
                ContentSnapshot::new("", ContentType::Plain),
            ),
            tail: OrderKeySpace::with_step(RELAY_TAIL_STEP),
        }
    }

    /// A board holding `snapshots` in order.
    pub fn load(snapshots: impl IntoIterator<Item = ContentSnapshot>) -> Result<Self, BoardError> {
        let mut board = Self::new();
        let mut snapshots = snapshots.into_iter();
        let Some(first) = snapshots.next() else {
            return Ok(board);
        };
        let mut parent = board
            .store
            .last_line()
            .cloned()
            .ok_or_else(|| BoardError::LineNotFound(LineId::blank()))?;
        board.store.upsert_or_move(parent.clone(), None, Some(first))?;
        for snapshot in snapshots {
            let (id, _) = board.create_line(Some(&parent), snapshot)?;
            parent = id;
        }
        Ok(board)
    }

    /// Every line with its position, for a newly connected client.
    pub fn lines(&self) -> Vec<LineUpdate> {
        self.store
            .ordered()
            .map(|r| LineUpdate::placed(r.id.clone(), r.order, r.content.clone()))
            .collect()
    }

    /// Insert a line after `parent` (after the last line when `None`).
    ///
    /// Returns the new id and the updates to broadcast: repositioned
    /// successors first, then the new line.
    pub fn create_line(
        &mut self,
        parent: Option<&LineId>,
        snapshot: ContentSnapshot,
    ) -> Result<(LineId, Vec<LineUpdate>), BoardError> {
        let parent = match parent {
            Some(id) => id.clone(),
            None => self
                .store
                .last_line()
                .cloned()
                .ok_or_else(|| BoardError::LineNotFound(LineId::blank()))?,
        };
        let parent_order = self
            .store
            .get(&parent)
            .map(|r| r.order)
            .ok_or_else(|| BoardError::LineNotFound(parent.clone()))?;

        let (order, moves) = self.release_space(parent_order)?;

        // Deepest successor first, so no two lines ever share a key.
        let mut updates = Vec::with_capacity(moves.len() + 1);
        for (id, moved) in moves {
            self.store.upsert_or_move(id.clone(), Some(Position::At(moved)), None)?;
            if let Some(record) = self.store.get(&id) {
                updates.push(LineUpdate::placed(id, moved, record.content.clone()));
            }
        }

        let id = new_line_id();
        self.store
            .upsert_or_move(id.clone(), Some(Position::At(order)), Some(snapshot.clone()))?;
        updates.push(LineUpdate::placed(id.clone(), order, snapshot));
        log::debug!("Line {id} created after {parent} at {order}");
        Ok((id, updates))
    }

    /// Key for a new line after `parent_order`, plus the successors that
    /// must move first (deepest first) to make room for it.
    fn release_space(
        &self,
        parent_order: OrderKey,
    ) -> Result<(OrderKey, Vec<(LineId, OrderKey)>), BoardError> {
        // Collect the run of successors sitting on adjacent keys.
        let mut run: Vec<(LineId, OrderKey)> = Vec::new();
        let mut lower = parent_order;
        let mut key = loop {
            match self.store.successor(lower) {
                None => break self.tail.next_key(lower)?,
                Some(next) if next.order - lower > 1 => break two_thirds(lower, next.order),
                Some(next) => {
                    run.push((next.id.clone(), next.order));
                    lower = next.order;
                }
            }
        };

        // Walk the run backwards: each line takes the key released behind
        // it, and the line before it splits the widened gap.
        let mut moves = Vec::with_capacity(run.len());
        while let Some((id, _)) = run.pop() {
            let below = run.last().map_or(parent_order, |(_, order)| *order);
            moves.push((id, key));
            key = two_thirds(below, key);
        }
        Ok((key, moves))
    }

    /// Delete a line. The last remaining line and unknown ids are refused.
    pub fn delete_line(&mut self, id: &LineId) -> Option<LineUpdate> {
        if !self.store.contains(id) {
            log::debug!("Refusing to delete unknown line {id}");
            return None;
        }
        if self.store.len() == 1 {
            log::debug!("Refusing to delete the last line {id}");
            return None;
        }
        self.store
            .upsert_or_move(id.clone(), Some(Position::Delete), None)
            .ok()?;
        Some(LineUpdate::deleted(id.clone()))
    }

    /// Apply a client's content update. Positions from clients are ignored;
    /// unknown lines and stale writes produce nothing to forward.
    pub fn write(&mut self, update: &LineUpdate) -> Option<LineUpdate> {
        if update.number.is_some() {
            log::debug!("Ignoring client position for line {}", update.id);
        }
        if !self.store.contains(&update.id) {
            return None;
        }
        let outcome = self
            .store
            .merge_remote(update.id.clone(), None, update.snapshot())
            .ok()?;
        match outcome {
            MergeOutcome::Applied { content_applied: true, .. } => {
                let record = self.store.get(&update.id)?;
                Some(LineUpdate::placed(record.id.clone(), record.order, record.content.clone()))
            }
            _ => None,
        }
    }

    /// The board as exported JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        self.store.to_json()
    }

    pub fn store(&self) -> &LineStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

fn two_thirds(lower: OrderKey, upper: OrderKey) -> OrderKey {
    let gap = (upper - lower) as u64;
    lower + (gap * 2 / 3) as OrderKey
}

fn new_line_id() -> LineId {
    LineId::Assigned(Uuid::new_v4().to_string())
}
