//! Signaling transports
//!
//! Peers exchange offers, answers and candidates over a small JSON protocol
//! compatible with PeerJS brokers:
//!
//! ```text
//! {"type":"OPEN","id":"<assigned id>"}
//! {"type":"OFFER","dst":"<peer>","payload":{"sdp":{...},"connectionId":"<id>",...}}
//! {"type":"ANSWER","dst":"<peer>","payload":{"sdp":{...},"connectionId":"<id>"}}
//! {"type":"CANDIDATE","dst":"<peer>","payload":{"candidate":{...},"connectionId":"<id>"}}
//! {"type":"ERROR","payload":{"msg":"<text>"}}
//! {"type":"HEARTBEAT"}
//! ```
//!
//! The broker stamps `src` on everything it forwards. Two transports share
//! this contract: [`CloudSignaling`] talks to a public broker and
//! [`LocalSignaling`] talks to a [`LocalSignalingServer`] run by the host.

mod client;
mod cloud;
mod local;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::connection::{IceCandidate, SessionDescription};
use super::error::NetworkError;

pub use cloud::CloudSignaling;
pub use local::{
    advertised_lan_ip, LocalSignaling, LocalSignalingServer, SignalingHub, LOCAL_HOST_ID,
};

/// Which signaling transport a host uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingMode {
    #[default]
    Cloud,
    Local,
}

/// Payload `type` PeerJS uses for data connections
const DATA_CONNECTION: &str = "data";

/// Signaling wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalingMessage {
    /// Registration acknowledged by the broker
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: DescriptionPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: DescriptionPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },
    Error {
        #[serde(default)]
        payload: ErrorPayload,
    },
    Heartbeat,
    /// Requested id is already registered
    #[serde(rename = "ID-TAKEN")]
    IdTaken {
        #[serde(default)]
        payload: ErrorPayload,
    },
    /// A message could not be delivered; `src` names the missing peer
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Payload of OFFER and ANSWER
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
}

impl DescriptionPayload {
    /// Offer payload in the shape PeerJS clients send
    pub fn offer(sdp: &str, correlation_id: &str) -> Self {
        Self {
            sdp: SessionDescription::offer(sdp),
            connection_id: Some(correlation_id.to_string()),
            kind: Some(DATA_CONNECTION.to_string()),
            label: Some(correlation_id.to_string()),
            reliable: Some(true),
            serialization: Some("json".to_string()),
        }
    }

    pub fn answer(sdp: &str, correlation_id: &str) -> Self {
        Self {
            sdp: SessionDescription::answer(sdp),
            connection_id: Some(correlation_id.to_string()),
            kind: Some(DATA_CONNECTION.to_string()),
            label: None,
            reliable: None,
            serialization: None,
        }
    }
}

/// Payload of CANDIDATE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: CandidateInit,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// Browser-style candidate object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: u32,
}

impl CandidatePayload {
    pub fn new(candidate: &IceCandidate, correlation_id: &str) -> Self {
        Self {
            candidate: CandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: Some(candidate.mid.clone()),
                sdp_m_line_index: 0,
            },
            kind: Some(DATA_CONNECTION.to_string()),
            connection_id: Some(correlation_id.to_string()),
        }
    }

    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate::new(
            self.candidate.candidate.clone(),
            self.candidate.sdp_mid.clone().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

impl SignalingMessage {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events a signaling transport reports
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Registration acknowledged under this id
    Connected(String),
    OfferReceived {
        from: String,
        sdp: String,
        correlation_id: Option<String>,
    },
    AnswerReceived {
        from: String,
        sdp: String,
        correlation_id: Option<String>,
    },
    CandidateReceived {
        from: String,
        candidate: IceCandidate,
        correlation_id: Option<String>,
    },
    /// The broker could not reach this peer (EXPIRE) or it left (LEAVE)
    PeerUnavailable { peer_id: String },
    Error(String),
    /// Socket closed without being asked to
    Closed,
}

/// Callback handle a signaling transport reports through
#[derive(Clone)]
pub struct SignalingSink(Arc<dyn Fn(SignalingEvent) + Send + Sync>);

impl SignalingSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(SignalingEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Sink that forwards into a channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn emit(&self, event: SignalingEvent) {
        (self.0)(event)
    }
}

/// A way to reach other peers before a direct channel exists.
///
/// `connect` returns immediately; the outcome is reported as
/// [`SignalingEvent::Connected`] or [`SignalingEvent::Error`]. Messages sent
/// before the broker acknowledged the registration are dropped.
pub trait SignalingTransport: Send {
    fn connect(&mut self, preferred_id: Option<String>) -> Result<(), NetworkError>;

    /// Close the socket. Reports nothing further. Idempotent.
    fn disconnect(&mut self);

    fn send_offer(&self, target: &str, sdp: &str, correlation_id: &str)
        -> Result<(), NetworkError>;

    fn send_answer(&self, target: &str, sdp: &str, correlation_id: &str)
        -> Result<(), NetworkError>;

    fn send_candidate(
        &self,
        target: &str,
        candidate: &IceCandidate,
        correlation_id: &str,
    ) -> Result<(), NetworkError>;

    fn is_connected(&self) -> bool;

    fn local_id(&self) -> Option<String>;
}
