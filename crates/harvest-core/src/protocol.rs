//! Wire envelopes exchanged with chat clients.
//!
//! Inbound: `{ "type": "query", "text": "...", "userId": "..."? }`.
//! Outbound: `{ "type": "response" | "timeout" | "error" | "broadcast", "text": "..." }`.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

pub const QUERY_TYPE: &str = "query";

/// Raw inbound envelope before its `type` is interpreted.
#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
}

/// A client message after classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Query {
        text: String,
        /// Identity claimed by the client. The connection's identity wins.
        claimed_user: Option<UserId>,
    },
    /// Any `type` this gateway does not handle.
    Unknown { kind: String },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("query text is required")]
    MissingText,
}

impl Inbound {
    pub fn parse(raw: &str) -> Result<Self, InboundError> {
        let envelope: RawInbound =
            serde_json::from_str(raw).map_err(|e| InboundError::Malformed(e.to_string()))?;

        if envelope.kind != QUERY_TYPE {
            return Ok(Self::Unknown {
                kind: envelope.kind,
            });
        }

        let text = envelope
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or(InboundError::MissingText)?;

        Ok(Self::Query {
            text,
            claimed_user: envelope.user_id.map(UserId::from_raw),
        })
    }
}

/// Message pushed to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Response { text: String },
    Timeout { text: String },
    Error { text: String },
    Broadcast { text: String },
}

impl OutboundMessage {
    pub fn response(text: impl Into<String>) -> Self {
        Self::Response { text: text.into() }
    }

    pub fn timeout(text: impl Into<String>) -> Self {
        Self::Timeout { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn broadcast(text: impl Into<String>) -> Self {
        Self::Broadcast { text: text.into() }
    }

    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::Timeout { .. } => "timeout",
            Self::Error { .. } => "error",
            Self::Broadcast { .. } => "broadcast",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Response { text }
            | Self::Timeout { text }
            | Self::Error { text }
            | Self::Broadcast { text } => text,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query() {
        let msg = Inbound::parse(r#"{"type":"query","text":"price of maize?"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Query {
                text: "price of maize?".into(),
                claimed_user: None,
            }
        );
    }

    #[test]
    fn parse_query_with_user_id() {
        let msg = Inbound::parse(r#"{"type":"query","text":"hi","userId":"u1"}"#).unwrap();
        match msg {
            Inbound::Query { claimed_user, .. } => {
                assert_eq!(claimed_user, Some(UserId::from_raw("u1")));
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = Inbound::parse(r#"{"type":"typing","text":"..."}"#).unwrap();
        assert_eq!(msg, Inbound::Unknown { kind: "typing".into() });
    }

    #[test]
    fn query_without_text_rejected() {
        assert_eq!(
            Inbound::parse(r#"{"type":"query"}"#),
            Err(InboundError::MissingText)
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"query","text":"   "}"#),
            Err(InboundError::MissingText)
        );
    }

    #[test]
    fn malformed_json_rejected() {
        let err = Inbound::parse("not json").unwrap_err();
        assert!(matches!(err, InboundError::Malformed(_)));

        let err = Inbound::parse(r#"{"text":"no type"}"#).unwrap_err();
        assert!(matches!(err, InboundError::Malformed(_)));
    }

    #[test]
    fn outbound_wire_shape() {
        let json = OutboundMessage::response("hello").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"type": "response", "text": "hello"}));

        let json = OutboundMessage::timeout("slow").to_json().unwrap();
        assert!(json.contains("\"type\":\"timeout\""));
    }

    #[test]
    fn outbound_kind_matches_tag() {
        for msg in [
            OutboundMessage::response("a"),
            OutboundMessage::timeout("b"),
            OutboundMessage::error("c"),
            OutboundMessage::broadcast("d"),
        ] {
            let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind());
            assert_eq!(value["text"], msg.text());
        }
    }
}
