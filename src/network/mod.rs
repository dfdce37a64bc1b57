//! Network module for room-based peer messaging
//!
//! Handles room codes, signaling (cloud broker or LAN discovery server),
//! connection negotiation, Star/Mesh topology and the session that ties
//! them together.

mod code;
mod connection;
mod envelope;
mod error;
mod negotiator;
mod session;
mod signaling;
mod tcp;
mod topology;

pub use code::{
    decode_lan_code, encode_lan_code, generate_cloud_code, is_cloud_code_format, NetworkCode,
    CLOUD_CODE_ALPHABET, CLOUD_CODE_LEN,
};
pub use connection::{
    Connection, ConnectionEvent, ConnectionSink, ConnectionState, Connector, DataChannel,
    IceCandidate, SdpType, SessionDescription,
};
pub use envelope::{EnvelopeKind, Frame, MessageEnvelope, SystemNotice, SYSTEM_TAG};
pub use error::NetworkError;
pub use negotiator::{NegotiationRole, RemotePeer, DATA_CHANNEL_LABEL};
pub use session::{NetworkSession, SessionEvent, SessionSnapshot, SessionStatus};
pub use signaling::{
    advertised_lan_ip, CandidateInit, CandidatePayload, CloudSignaling, DescriptionPayload, ErrorPayload,
    LocalSignaling, LocalSignalingServer, SignalingEvent, SignalingHub, SignalingMessage,
    SignalingMode, SignalingSink, SignalingTransport, LOCAL_HOST_ID,
};
pub use tcp::{TcpConnection, TcpConnector, TcpDataChannel, MAX_FRAME_LEN};
pub use topology::{NoticeAction, Topology, TopologyController};
