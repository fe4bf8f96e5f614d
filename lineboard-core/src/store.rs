//! In-memory ordered line store.
//!
//! ```text
//!  local edit ──► edit_line ──► dirty ──► drain_changes ──► wire
//!                                   
//!  wire ──► merge_remote ──┐
//!                          ├──► lines (id → record) + by_order (key → id)
//!  authority ──► upsert ───┘
//! ```
//!
//! The store keeps two pointers next to the lines: the last line (greatest
//! key, kept current after every insert, move and delete) and the active
//! line (the one holding input focus). Together they decide where a new
//! line is anchored.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::BoardError;
use crate::line::{ContentSnapshot, LineId, LineRecord};
use crate::order::{OrderKey, Position, MAX_KEY};

/// What a merge did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to do (e.g. deleting an unknown line).
    Ignored,
    Deleted,
    Applied {
        created: bool,
        /// False when no snapshot was given or it lost to a newer one.
        content_applied: bool,
    },
}

/// The authoritative set of lines of one board.
#[derive(Debug, Default)]
pub struct LineStore {
    lines: HashMap<LineId, LineRecord>,
    by_order: BTreeMap<OrderKey, LineId>,
    dirty: HashSet<LineId>,
    last_line: Option<LineId>,
    active_line: Option<LineId>,
    /// Highest timestamp seen or issued.
    clock: u64,
}

impl LineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding exactly one line.
    pub fn with_first_line(id: LineId, order: OrderKey, snapshot: ContentSnapshot) -> Self {
        let mut store = Self::default();
        store.create(id.clone(), order);
        store.apply_content(&id, snapshot, false);
        store
    }

    // ───────────────────────────────────────────────────────────────
    // Merging
    // ───────────────────────────────────────────────────────────────

    /// Create, move, update or delete a line on behalf of the local author.
    ///
    /// Content is applied without timestamp gating: local edits are
    /// authoritative for their own line.
    pub fn upsert_or_move(
        &mut self,
        id: LineId,
        position: Option<Position>,
        snapshot: Option<ContentSnapshot>,
    ) -> Result<MergeOutcome, BoardError> {
        self.merge(id, position, snapshot, false)
    }

    /// Same as [`upsert_or_move`](Self::upsert_or_move) for a message from
    /// a peer: a snapshot whose timestamp is not newer than the held one
    /// leaves the content untouched.
    pub fn merge_remote(
        &mut self,
        id: LineId,
        position: Option<Position>,
        snapshot: Option<ContentSnapshot>,
    ) -> Result<MergeOutcome, BoardError> {
        self.merge(id, position, snapshot, true)
    }

    fn merge(
        &mut self,
        id: LineId,
        position: Option<Position>,
        snapshot: Option<ContentSnapshot>,
        gated: bool,
    ) -> Result<MergeOutcome, BoardError> {
        let exists = self.lines.contains_key(&id);

        // Validate everything first so a rejected message leaves no trace.
        let target = match position {
            Some(Position::Delete) => {
                if !exists {
                    return Ok(MergeOutcome::Ignored);
                }
                self.remove(&id);
                return Ok(MergeOutcome::Deleted);
            }
            Some(Position::At(order)) => Some(order),
            None if exists => None,
            None => Some(MAX_KEY),
        };
        if let Some(order) = target {
            if let Some(holder) = self.by_order.get(&order) {
                if *holder != id {
                    return Err(BoardError::OrderCollision {
                        order,
                        existing: holder.clone(),
                    });
                }
            }
        }

        let created = !exists;
        match (created, target) {
            (true, Some(order)) => self.create(id.clone(), order),
            (false, Some(order)) => self.reposition(&id, order),
            _ => {}
        }

        let content_applied = match snapshot {
            Some(snapshot) if !snapshot.is_empty() => self.apply_content(&id, snapshot, gated),
            _ => false,
        };

        Ok(MergeOutcome::Applied {
            created,
            content_applied,
        })
    }

    fn apply_content(&mut self, id: &LineId, snapshot: ContentSnapshot, gated: bool) -> bool {
        if let Some(ts) = snapshot.timestamp {
            self.clock = self.clock.max(ts);
        }
        let Some(record) = self.lines.get_mut(id) else {
            return false;
        };
        if gated {
            if let (Some(incoming), Some(held)) = (snapshot.timestamp, record.content.timestamp) {
                if incoming <= held {
                    log::debug!("Discarding stale content for line {id} ({incoming} <= {held})");
                    return false;
                }
            }
        }
        record.content.apply(snapshot);
        true
    }

    fn create(&mut self, id: LineId, order: OrderKey) {
        let last_before = self.last_line_order();
        self.lines.insert(id.clone(), LineRecord::new(id.clone(), order));
        self.by_order.insert(order, id.clone());
        self.track_last(&id, order, last_before);
    }

    fn reposition(&mut self, id: &LineId, order: OrderKey) {
        // Read the last line before the key is overwritten.
        let last_before = self.last_line_order();
        let Some(record) = self.lines.get_mut(id) else {
            return;
        };
        let previous = record.order;
        if previous == order {
            return;
        }
        record.order = order;
        self.by_order.remove(&previous);
        self.by_order.insert(order, id.clone());
        self.track_last(id, order, last_before);
    }

    fn track_last(&mut self, id: &LineId, order: OrderKey, last_before: Option<(LineId, OrderKey)>) {
        match last_before {
            Some((_, last_order)) if last_order < order => self.last_line = Some(id.clone()),
            // The last line itself moved down.
            Some((last_id, _)) if last_id == *id => self.recompute_last(),
            Some(_) => {}
            None => self.recompute_last(),
        }
    }

    fn remove(&mut self, id: &LineId) -> Option<LineRecord> {
        let record = self.lines.remove(id)?;
        self.by_order.remove(&record.order);
        if self.active_line.as_ref() == Some(id) {
            self.active_line = None;
        }
        if self.last_line.as_ref() == Some(id) {
            self.recompute_last();
        }
        Some(record)
    }

    /// Key of the last line, if the pointer still refers to a live line.
    fn last_line_order(&self) -> Option<(LineId, OrderKey)> {
        let last = self.last_line.as_ref()?;
        self.lines.get(last).map(|r| (r.id.clone(), r.order))
    }

    fn recompute_last(&mut self) {
        self.last_line = self.by_order.last_key_value().map(|(_, id)| id.clone());
    }

    // ───────────────────────────────────────────────────────────────
    // Local authoring
    // ───────────────────────────────────────────────────────────────

    /// Apply an edit made by the local author and queue it for the peer.
    ///
    /// The snapshot is stamped with a timestamp newer than anything this
    /// store has seen. Returns that timestamp.
    pub fn edit_line(&mut self, id: &LineId, mut snapshot: ContentSnapshot) -> Result<u64, BoardError> {
        let record = self
            .lines
            .get_mut(id)
            .ok_or_else(|| BoardError::LineNotFound(id.clone()))?;
        let held = record.content.timestamp.unwrap_or(0);
        let timestamp = self.clock.max(held) + 1;
        self.clock = timestamp;
        snapshot.timestamp = Some(timestamp);
        record.content.apply(snapshot);
        self.dirty.insert(id.clone());
        Ok(timestamp)
    }

    pub fn mark_dirty(&mut self, id: LineId) {
        self.dirty.insert(id);
    }

    /// Take every locally changed line with its current snapshot.
    ///
    /// Lines deleted since being marked are skipped. The dirty set is
    /// cleared; a second call without new edits returns nothing.
    pub fn drain_changes(&mut self) -> Vec<(LineId, ContentSnapshot)> {
        let mut changes: Vec<(OrderKey, LineId, ContentSnapshot)> = self
            .dirty
            .drain()
            .filter_map(|id| {
                let record = self.lines.get(&id)?;
                Some((record.order, id, record.content.clone()))
            })
            .collect();
        changes.sort_by_key(|(order, _, _)| *order);
        changes.into_iter().map(|(_, id, content)| (id, content)).collect()
    }

    pub fn focus_changed(&mut self, id: &LineId, focused: bool) {
        if focused {
            self.active_line = Some(id.clone());
        } else if self.active_line.as_ref() == Some(id) {
            self.active_line = None;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────

    /// All snapshots in board order.
    pub fn serialize(&self) -> Vec<ContentSnapshot> {
        self.ordered().map(|r| r.content.clone()).collect()
    }

    /// The board as a JSON array of `{value, contentType}` in board order.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let lines: Vec<ContentSnapshot> = self.ordered().map(|r| r.content.without_timestamp()).collect();
        serde_json::to_string(&lines)
    }

    pub fn ordered(&self) -> impl Iterator<Item = &LineRecord> {
        self.by_order.values().filter_map(|id| self.lines.get(id))
    }

    /// The line directly after `order`, if any.
    pub fn successor(&self, order: OrderKey) -> Option<&LineRecord> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.by_order
            .range((Excluded(order), Unbounded))
            .next()
            .and_then(|(_, id)| self.lines.get(id))
    }

    /// Where a new line goes: after the focused line, else after the last.
    pub fn insertion_anchor(&self) -> Option<&LineId> {
        self.active_line
            .as_ref()
            .filter(|id| self.lines.contains_key(*id))
            .or(self.last_line.as_ref())
    }

    pub fn get(&self, id: &LineId) -> Option<&LineRecord> {
        self.lines.get(id)
    }

    pub fn contains(&self, id: &LineId) -> bool {
        self.lines.contains_key(id)
    }

    pub fn last_line(&self) -> Option<&LineId> {
        self.last_line.as_ref()
    }

    pub fn active_line(&self) -> Option<&LineId> {
        self.active_line.as_ref()
    }

    pub fn is_dirty(&self, id: &LineId) -> bool {
        self.dirty.contains(id)
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
