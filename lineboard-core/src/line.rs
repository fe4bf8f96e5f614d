//! Line identity and content snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::order::OrderKey;

/// Identity of a line within a board.
///
/// Lines minted locally carry a small integer; lines assigned by a remote
/// authority carry its token. Ids are never reused after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LineId {
    Local(u64),
    Assigned(String),
}

impl LineId {
    /// The empty token, used on the wire for "no parent".
    pub fn blank() -> Self {
        LineId::Assigned(String::new())
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, LineId::Assigned(s) if s.is_empty())
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineId::Local(n) => write!(f, "{n}"),
            LineId::Assigned(s) => f.write_str(s),
        }
    }
}

impl From<u64> for LineId {
    fn from(n: u64) -> Self {
        LineId::Local(n)
    }
}

impl From<&str> for LineId {
    fn from(s: &str) -> Self {
        LineId::Assigned(s.to_string())
    }
}

impl From<String> for LineId {
    fn from(s: String) -> Self {
        LineId::Assigned(s)
    }
}

/// Markup language of a line's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "katex")]
    Katex,
    #[serde(rename = "asciimath")]
    AsciiMath,
}

/// Versioned content of one line.
///
/// Absent fields mean "unchanged" when the snapshot is applied on top of
/// an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    /// Logical clock used for last-write-wins; higher wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ContentSnapshot {
    pub fn new(value: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            value: Some(value.into()),
            content_type: Some(content_type),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// True when the snapshot carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.content_type.is_none() && self.timestamp.is_none()
    }

    /// Overwrite the fields present in `incoming`, keep the rest.
    pub fn apply(&mut self, incoming: ContentSnapshot) {
        if let Some(value) = incoming.value {
            self.value = Some(value);
        }
        if let Some(content_type) = incoming.content_type {
            self.content_type = Some(content_type);
        }
        if let Some(timestamp) = incoming.timestamp {
            self.timestamp = Some(timestamp);
        }
    }

    /// Copy without the clock, as shown to readers of the board.
    pub fn without_timestamp(&self) -> Self {
        Self {
            value: self.value.clone(),
            content_type: self.content_type,
            timestamp: None,
        }
    }
}

/// One line held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    pub id: LineId,
    pub order: OrderKey,
    pub content: ContentSnapshot,
}

impl LineRecord {
    pub fn new(id: LineId, order: OrderKey) -> Self {
        Self {
            id,
            order,
            content: ContentSnapshot::default(),
        }
    }
}
