//! Sparse integer ordering keys.
//!
//! Lines are ordered by a 31-bit key. Appending at the tail advances by a
//! fixed step; inserting between two neighbours takes the midpoint of their
//! gap, so no existing key ever moves.
//!
//! ```text
//! 0            107374          214748                     2^31-1
//! ├──────────────┼───────────────┼───────── ... ──────────────┤
//! A        split(A, B)           B = next(A)              MAX_KEY
//! ```
//!
//! Every split halves the gap, so two neighbours allow about `log2(gap)`
//! insertions between them. Running out is reported as
//! [`BoardError::InsufficientSpace`] and never retried.

use serde::{Deserialize, Serialize};

use crate::error::BoardError;

/// Position of a line within its board.
pub type OrderKey = u32;

/// Largest valid key (`2^31 - 1`).
pub const MAX_KEY: OrderKey = i32::MAX as OrderKey;

/// Number of tail appends the default key space is sized for.
pub const EXPECTED_CAPACITY: u32 = 10_000;

/// Wire value of `number` that deletes a line.
pub const DELETE_SENTINEL: i64 = -1;

/// A requested change to a line's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// Place the line at this key.
    At(OrderKey),
    /// Remove the line.
    Delete,
}

impl Position {
    /// Interpret a wire `number`.
    pub fn from_wire(number: i64) -> Result<Self, BoardError> {
        if number == DELETE_SENTINEL {
            return Ok(Position::Delete);
        }
        if (0..=MAX_KEY as i64).contains(&number) {
            Ok(Position::At(number as OrderKey))
        } else {
            Err(BoardError::InvalidOrder(number))
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Position::At(key) => key as i64,
            Position::Delete => DELETE_SENTINEL,
        }
    }
}

/// Allocator for order keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKeySpace {
    step: OrderKey,
}

impl Default for OrderKeySpace {
    fn default() -> Self {
        Self::with_capacity(EXPECTED_CAPACITY)
    }
}

impl OrderKeySpace {
    /// Size the tail step so that `expected_capacity` appends fit in the range.
    pub fn with_capacity(expected_capacity: u32) -> Self {
        Self {
            step: (MAX_KEY / expected_capacity.max(1)).max(1),
        }
    }

    /// Key space with an explicit tail step.
    pub fn with_step(step: OrderKey) -> Self {
        Self {
            step: step.clamp(1, MAX_KEY),
        }
    }

    /// Distance between consecutive tail appends.
    pub fn step(&self) -> OrderKey {
        self.step
    }

    /// Key of the first line of an empty board.
    pub fn first_key(&self) -> OrderKey {
        0
    }

    /// Key for a line appended after `after_last`.
    ///
    /// Near the top of the range the step no longer fits; the remaining room
    /// up to [`MAX_KEY`] is split instead.
    pub fn next_key(&self, after_last: OrderKey) -> Result<OrderKey, BoardError> {
        match after_last.checked_add(self.step) {
            Some(key) if key <= MAX_KEY => Ok(key),
            _ => self.split_key(after_last, MAX_KEY),
        }
    }

    /// Key strictly between `lower` and `upper`.
    pub fn split_key(&self, lower: OrderKey, upper: OrderKey) -> Result<OrderKey, BoardError> {
        if upper <= lower {
            return Err(BoardError::InsufficientSpace { lower, upper });
        }
        let key = lower + (upper - lower) / 2;
        if key == lower {
            return Err(BoardError::InsufficientSpace { lower, upper });
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_step() {
        let space = OrderKeySpace::default();
        assert_eq!(space.step(), 214_748);
        assert_eq!(space.first_key(), 0);
    }

    #[test]
    fn test_next_key_appends_step() {
        let space = OrderKeySpace::default();
        assert_eq!(space.next_key(0).unwrap(), 214_748);
        assert_eq!(space.next_key(214_748).unwrap(), 429_496);
    }

    #[test]
    fn test_next_key_near_max_splits_remainder() {
        let space = OrderKeySpace::default();
        let key = space.next_key(MAX_KEY - 10).unwrap();
        assert!(key > MAX_KEY - 10 && key < MAX_KEY);
        assert_eq!(
            space.next_key(MAX_KEY),
            Err(BoardError::InsufficientSpace { lower: MAX_KEY, upper: MAX_KEY })
        );
    }

    #[test]
    fn test_split_key_midpoint() {
        let space = OrderKeySpace::default();
        assert_eq!(space.split_key(0, 214_748).unwrap(), 107_374);
        assert_eq!(space.split_key(10, 12).unwrap(), 11);
    }

    #[test]
    fn test_split_key_always_strictly_between() {
        let space = OrderKeySpace::default();
        for (a, b) in [(0u32, 2u32), (5, 9), (100, 1_000_000), (0, MAX_KEY), (MAX_KEY - 2, MAX_KEY)] {
            let k = space.split_key(a, b).unwrap();
            assert!(a < k && k < b, "{a} < {k} < {b}");
        }
    }

    #[test]
    fn test_split_key_adjacent_fails() {
        let space = OrderKeySpace::default();
        assert_eq!(
            space.split_key(7, 8),
            Err(BoardError::InsufficientSpace { lower: 7, upper: 8 })
        );
        assert!(space.split_key(7, 7).is_err());
        assert!(space.split_key(9, 3).is_err());
    }

    #[test]
    fn test_split_exhausts_after_log2_gap() {
        let space = OrderKeySpace::default();
        let lower = 0;
        let mut upper = 1024;
        let mut splits = 0;
        while let Ok(k) = space.split_key(lower, upper) {
            upper = k;
            splits += 1;
        }
        assert_eq!(splits, 10);
    }

    #[test]
    fn test_custom_capacity() {
        let space = OrderKeySpace::with_capacity(2);
        assert_eq!(space.step(), MAX_KEY / 2);
        let space = OrderKeySpace::with_capacity(0);
        assert_eq!(space.step(), MAX_KEY);
        assert_eq!(OrderKeySpace::with_step(65_536).next_key(0).unwrap(), 65_536);
        assert_eq!(OrderKeySpace::with_step(0).step(), 1);
    }

    #[test]
    fn test_position_from_wire() {
        assert_eq!(Position::from_wire(-1).unwrap(), Position::Delete);
        assert_eq!(Position::from_wire(0).unwrap(), Position::At(0));
        assert_eq!(Position::from_wire(MAX_KEY as i64).unwrap(), Position::At(MAX_KEY));
        assert_eq!(Position::from_wire(-2), Err(BoardError::InvalidOrder(-2)));
        assert_eq!(
            Position::from_wire(MAX_KEY as i64 + 1),
            Err(BoardError::InvalidOrder(MAX_KEY as i64 + 1))
        );
        assert_eq!(Position::Delete.to_wire(), -1);
    }
}
