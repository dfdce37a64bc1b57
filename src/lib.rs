//! peerlink - Room-based peer-to-peer messaging
//!
//! A host opens a room and shares a short code; joiners use the code to
//! find the host through a signaling broker (cloud) or the host's own
//! discovery server (LAN), then exchange JSON messages over direct
//! channels in a Star or Mesh topology.

pub mod config;
pub mod network;

pub use config::NetworkConfig;
pub use network::{NetworkSession, SessionEvent, SessionStatus, SignalingMode, Topology};
