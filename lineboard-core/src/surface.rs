//! Narrow interfaces to the presentation side of a board.

use std::collections::HashMap;

use crate::line::{ContentType, LineId};

/// Something that can display a line's content.
pub trait RenderSurface {
    fn render(&mut self, content: &str, content_type: ContentType);
}

/// Key → boolean store for per-line UI preferences (edit mode).
pub trait PreferenceStore {
    fn get(&self, key: &str) -> Option<bool>;
    fn set(&mut self, key: &str, value: bool);
}

/// Preferences kept in memory for the lifetime of the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryPreferences {
    values: HashMap<String, bool>,
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<bool> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), value);
    }
}

/// Builds preference keys scoped to one board: `"<board>/<line>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    board: String,
}

impl StorageKeys {
    pub fn new(board: impl Into<String>) -> Self {
        Self { board: board.into() }
    }

    pub fn key(&self, line: &LineId) -> String {
        format!("{}/{}", self.board, line)
    }
}
