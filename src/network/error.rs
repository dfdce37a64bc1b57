//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Room is full (max {max_nodes} nodes)")]
    CapacityExceeded { max_nodes: usize },

    #[error("Negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("Invalid room code: {0}")]
    InvalidCode(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
