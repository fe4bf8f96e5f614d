//! JSON wire protocol.
//!
//! Line updates travel one per text frame in both directions:
//! ```text
//! { "id": <LineId>, "value"?: str, "contentType"?: str, "number"?: int, "timestamp"?: int }
//! ```
//! - `number == -1` deletes the line, an absent `number` leaves it in place
//! - absent `value` / `contentType` leave those fields unchanged
//!
//! The control socket carries authority requests:
//! ```text
//! { "parent": <LineId | "">, "value": { "value": str, "contentType": str } }  ──►  <new id>
//! { "delete": <LineId> }                                                         ──►  true | false
//! ```
//! Failures are answered with `{ "error": str }`.

use lineboard_core::{
    BoardError, ContentSnapshot, ContentType, LineId, LineStore, MergeOutcome, OrderKey, Position,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One line change on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineUpdate {
    pub id: LineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl LineUpdate {
    /// A pure content update.
    pub fn content(id: LineId, snapshot: ContentSnapshot) -> Self {
        Self {
            id,
            value: snapshot.value,
            content_type: snapshot.content_type,
            number: None,
            timestamp: snapshot.timestamp,
        }
    }

    /// Full state of a line, including its position.
    pub fn placed(id: LineId, order: OrderKey, snapshot: ContentSnapshot) -> Self {
        Self {
            number: Some(Position::At(order).to_wire()),
            ..Self::content(id, snapshot)
        }
    }

    pub fn deleted(id: LineId) -> Self {
        Self {
            id,
            value: None,
            content_type: None,
            number: Some(Position::Delete.to_wire()),
            timestamp: None,
        }
    }

    pub fn position(&self) -> Result<Option<Position>, BoardError> {
        self.number.map(Position::from_wire).transpose()
    }

    /// Content part of the update, if it carries any.
    pub fn snapshot(&self) -> Option<ContentSnapshot> {
        let snapshot = ContentSnapshot {
            value: self.value.clone(),
            content_type: self.content_type,
            timestamp: self.timestamp,
        };
        (!snapshot.is_empty()).then_some(snapshot)
    }

    /// Merge into a store as a remote-origin update.
    pub fn apply_to(&self, store: &mut LineStore) -> Result<MergeOutcome, BoardError> {
        let position = self.position()?;
        store.merge_remote(self.id.clone(), position, self.snapshot())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame. Falsy JSON (`null`, `false`, `0`, `""`) is
    /// reported as [`ProtocolError::EmptyMessage`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if is_falsy(&value) {
            return Err(ProtocolError::EmptyMessage);
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

// ───────────────────────────────────────────────────────────────────
// Control requests
// ───────────────────────────────────────────────────────────────────

/// Ask the authority for a new line after `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLineRequest {
    /// Blank means "after the last line".
    pub parent: LineId,
    pub value: ContentSnapshot,
}

impl CreateLineRequest {
    pub fn new(parent: Option<LineId>, value: ContentSnapshot) -> Self {
        Self {
            parent: parent.unwrap_or_else(LineId::blank),
            value,
        }
    }

    pub fn parent(&self) -> Option<&LineId> {
        Some(&self.parent).filter(|p| !p.is_blank())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteLineRequest {
    pub delete: LineId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlRequest {
    Create(CreateLineRequest),
    Delete(DeleteLineRequest),
}

impl ControlRequest {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Reply body for a failed control request.
pub fn error_reply(message: impl Into<String>) -> String {
    let reply = ErrorReply {
        error: message.into(),
    };
    serde_json::to_string(&reply).unwrap_or_else(|_| r#"{"error":"unknown"}"#.to_string())
}

/// Interpret the reply to a create request: the new id as raw text
/// (a JSON number or quoted string is accepted too).
pub fn parse_assigned(reply: &str) -> Result<LineId, ProtocolError> {
    if let Ok(ErrorReply { error }) = serde_json::from_str::<ErrorReply>(reply) {
        return Err(ProtocolError::Rejected(error));
    }
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(ProtocolError::UnexpectedReply("empty line id".to_string()));
    }
    Ok(serde_json::from_str::<LineId>(reply).unwrap_or_else(|_| LineId::from(reply)))
}

/// Interpret the reply to a delete request.
pub fn parse_ack(reply: &str) -> Result<bool, ProtocolError> {
    match reply.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other if serde_json::from_str::<ErrorReply>(other).is_ok() => Ok(false),
        other => Err(ProtocolError::UnexpectedReply(other.to_string())),
    }
}

/// Protocol and transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("empty message")]
    EmptyMessage,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::WebSocket(other.to_string()),
        }
    }
}

impl From<ProtocolError> for BoardError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Rejected(reason) => BoardError::Authority(reason),
            other => BoardError::Authority(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content_update() {
        let update = LineUpdate::decode(r#"{"id":"a1","value":"x^2","contentType":"asciimath"}"#).unwrap();
        assert_eq!(update.id, LineId::from("a1"));
        assert_eq!(update.value.as_deref(), Some("x^2"));
        assert_eq!(update.content_type, Some(ContentType::AsciiMath));
        assert_eq!(update.position().unwrap(), None);
    }

    #[test]
    fn test_decode_numeric_id_and_delete() {
        let update = LineUpdate::decode(r#"{"id":3,"number":-1}"#).unwrap();
        assert_eq!(update.id, LineId::Local(3));
        assert_eq!(update.position().unwrap(), Some(Position::Delete));
        assert!(update.snapshot().is_none());
    }

    #[test]
    fn test_decode_rejects_falsy_and_garbage() {
        for text in ["null", "false", "0", "\"\""] {
            assert_eq!(LineUpdate::decode(text), Err(ProtocolError::EmptyMessage), "{text}");
        }
        assert!(matches!(
            LineUpdate::decode("{not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(matches!(
            LineUpdate::decode(r#"{"value":"no id"}"#),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_encode_omits_absent_fields() {
        let update = LineUpdate::content(
            LineId::from("a"),
            ContentSnapshot {
                value: Some("v".into()),
                ..ContentSnapshot::default()
            },
        );
        assert_eq!(update.encode().unwrap(), r#"{"id":"a","value":"v"}"#);
        assert_eq!(
            LineUpdate::deleted(LineId::Local(1)).encode().unwrap(),
            r#"{"id":1,"number":-1}"#
        );
    }

    #[test]
    fn test_placed_carries_number_and_timestamp() {
        let update = LineUpdate::placed(
            LineId::from("a"),
            65_536,
            ContentSnapshot::new("", ContentType::Katex).with_timestamp(2),
        );
        assert_eq!(
            update.encode().unwrap(),
            r#"{"id":"a","value":"","contentType":"katex","number":65536,"timestamp":2}"#
        );
    }

    #[test]
    fn test_invalid_number_fails_to_apply() {
        let mut store = LineStore::new();
        let update = LineUpdate::decode(r#"{"id":"a","number":-7}"#).unwrap();
        assert_eq!(update.apply_to(&mut store), Err(BoardError::InvalidOrder(-7)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_creates_and_updates() {
        let mut store = LineStore::new();
        LineUpdate::decode(r#"{"id":"a","number":0,"value":"x","timestamp":10}"#)
            .unwrap()
            .apply_to(&mut store)
            .unwrap();
        LineUpdate::decode(r#"{"id":"a","value":"y","timestamp":5}"#)
            .unwrap()
            .apply_to(&mut store)
            .unwrap();
        let record = store.get(&"a".into()).unwrap();
        assert_eq!(record.order, 0);
        assert_eq!(record.content.value.as_deref(), Some("x"));
    }

    #[test]
    fn test_control_requests() {
        let create = ControlRequest::decode(r#"{"parent":"","value":{"value":"","contentType":"plain"}}"#).unwrap();
        match create {
            ControlRequest::Create(req) => {
                assert!(req.parent().is_none());
                assert_eq!(req.value, ContentSnapshot::new("", ContentType::Plain));
            }
            other => panic!("expected create, got {other:?}"),
        }

        let delete = ControlRequest::decode(r#"{"delete":"abc"}"#).unwrap();
        assert_eq!(
            delete,
            ControlRequest::Delete(DeleteLineRequest { delete: "abc".into() })
        );

        let encoded = ControlRequest::Create(CreateLineRequest::new(
            Some(LineId::from("p")),
            ContentSnapshot::new("", ContentType::Katex),
        ))
        .encode()
        .unwrap();
        assert_eq!(encoded, r#"{"parent":"p","value":{"value":"","contentType":"katex"}}"#);
    }

    #[test]
    fn test_parse_assigned_forms() {
        assert_eq!(
            parse_assigned("6f1c2d5e-0000-4000-8000-000000000000").unwrap(),
            LineId::from("6f1c2d5e-0000-4000-8000-000000000000")
        );
        assert_eq!(parse_assigned("12").unwrap(), LineId::Local(12));
        assert_eq!(parse_assigned("\"q\"").unwrap(), LineId::from("q"));
        assert_eq!(
            parse_assigned(&error_reply("line p does not exist")),
            Err(ProtocolError::Rejected("line p does not exist".into()))
        );
        assert!(parse_assigned("  ").is_err());
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_ack("true"), Ok(true));
        assert_eq!(parse_ack("false"), Ok(false));
        assert_eq!(parse_ack(&error_reply("nope")), Ok(false));
        assert!(parse_ack("maybe").is_err());
    }

    #[test]
    fn test_protocol_error_maps_to_board_error() {
        let err: BoardError = ProtocolError::Rejected("full".into()).into();
        assert_eq!(err, BoardError::Authority("full".into()));
        let err: BoardError = ProtocolError::Timeout.into();
        assert_eq!(err, BoardError::Authority("connection timeout".into()));
    }
}
