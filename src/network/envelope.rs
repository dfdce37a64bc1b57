//! Application data-channel wire format
//!
//! Application traffic is a compact JSON envelope:
//!
//! ```text
//! {"t":"m","d":{...}}                 fire-and-forget message
//! {"t":"s","d":{...}}                 replaceable state update
//! {"t":"m","d":{...},"from":"<id>"}   relayed by a Star host
//! ```
//!
//! Session-internal notices share the channel but carry a `_sys` tag and are
//! never surfaced to the application.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::NetworkError;

/// Field that marks a frame as a system notice
pub const SYSTEM_TAG: &str = "_sys";

/// Kind of application payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "m")]
    Message,
    #[serde(rename = "s")]
    State,
}

/// Application message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "t")]
    pub kind: EnvelopeKind,
    /// Opaque application payload
    #[serde(rename = "d", default)]
    pub data: Value,
    /// Original sender, present only on relayed messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl MessageEnvelope {
    pub fn message(data: Value) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            data,
            from: None,
        }
    }

    pub fn state(data: Value) -> Self {
        Self {
            kind: EnvelopeKind::State,
            data,
            from: None,
        }
    }

    /// Copy of this envelope stamped with the original sender, for relaying
    pub fn relayed_from(&self, origin: &str) -> Self {
        Self {
            from: Some(origin.to_string()),
            ..self.clone()
        }
    }
}

/// Topology notices exchanged between sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_sys", rename_all = "snake_case")]
pub enum SystemNotice {
    /// Sent by a Mesh host to a newcomer: peers it should connect to
    MeshPeers { nodes: Vec<String> },
    /// A node finished joining the room
    NodeJoined {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// A node left the room
    NodeLeft {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
}

/// A decoded data-channel frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    App(MessageEnvelope),
    System(SystemNotice),
}

/// Encode an application envelope
pub fn encode(envelope: &MessageEnvelope) -> Result<String, NetworkError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Encode a system notice
pub fn encode_notice(notice: &SystemNotice) -> Result<String, NetworkError> {
    Ok(serde_json::to_string(notice)?)
}

/// Decode one data-channel frame
pub fn decode(text: &str) -> Result<Frame, NetworkError> {
    let value: Value = serde_json::from_str(text)?;
    if value.get(SYSTEM_TAG).is_some() {
        Ok(Frame::System(serde_json::from_value(value)?))
    } else {
        Ok(Frame::App(serde_json::from_value(value)?))
    }
}
