//! Transport capability consumed by the session
//!
//! A [`Connection`] is an opaque point-to-point transport (NAT traversal,
//! encryption and the like live behind it). It negotiates through session
//! descriptions and candidates, and yields a [`DataChannel`] once open.
//! Everything a connection observes asynchronously is reported through the
//! [`ConnectionSink`] it was created with, never applied in place.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::NetworkError;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A transport candidate and the media line it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub mid: String,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, mid: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            mid: mid.into(),
        }
    }
}

/// Connection state
///
/// ```text
/// New --> Connecting --> Connected
/// Connecting | Connected --> Disconnected | Failed | Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Terminal states that end the peer
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Events a connection reports about itself
pub enum ConnectionEvent {
    /// Local description is ready to be signaled
    LocalDescription(SessionDescription),
    /// A local candidate was gathered (trickled)
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The remote side opened a channel (answerer side)
    DataChannel(Box<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDescription(desc) => write!(f, "LocalDescription({:?})", desc.kind),
            Self::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            Self::StateChanged(state) => write!(f, "StateChanged({:?})", state),
            Self::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelMessage(m) => write!(f, "ChannelMessage({} bytes)", m.len()),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Callback handle a connection reports through.
///
/// The closure is captured when the connection is created, so it already
/// knows which peer and negotiation the events belong to.
#[derive(Clone)]
pub struct ConnectionSink(Arc<dyn Fn(ConnectionEvent) + Send + Sync>);

impl ConnectionSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Sink that forwards into a channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn emit(&self, event: ConnectionEvent) {
        (self.0)(event)
    }
}

/// Factory for connections
pub trait Connector: Send + Sync {
    fn create(&self, sink: ConnectionSink) -> Result<Box<dyn Connection>, NetworkError>;
}

/// One negotiated transport to a remote node
pub trait Connection: Send {
    /// Create the outgoing data channel. On the offering side this starts
    /// negotiation: the local offer is reported asynchronously.
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>, NetworkError>;

    /// Apply the remote offer or answer. Applying an offer makes the
    /// connection produce its local answer asynchronously.
    fn set_remote_description(&mut self, description: SessionDescription)
        -> Result<(), NetworkError>;

    fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NetworkError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Ordered, reliable message channel over a connection
pub trait DataChannel: Send {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, message: &str) -> Result<(), NetworkError>;

    /// Close the channel. Idempotent.
    fn close(&mut self);
}
