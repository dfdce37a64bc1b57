//! Per-peer connection negotiation
//!
//! ```text
//! offerer                          answerer
//!   initiate ── create channel
//!   LocalDescription ── OFFER ───▶ respond ── set remote offer
//!                      ◀── ANSWER ── LocalDescription
//!   apply_answer
//!   LocalCandidate ── CANDIDATE ─▶ apply_candidate     (both directions)
//!   ChannelOpen  ──────────────────  ChannelOpen       ready
//! ```
//!
//! Every negotiation gets a number; connection events and timeouts are
//! tagged with it so the session can drop events from a negotiation it has
//! already abandoned.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::connection::{
    Connection, ConnectionEvent, ConnectionSink, Connector, DataChannel, IceCandidate, SdpType,
    SessionDescription,
};
use super::error::NetworkError;
use super::signaling::SignalingTransport;

/// Label of the application data channel
pub const DATA_CHANNEL_LABEL: &str = "peerlink";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Something that happened to a negotiation, outside the session
pub(crate) enum PeerSignal {
    Connection(ConnectionEvent),
    Timeout,
}

pub(crate) struct PeerInput {
    pub peer_id: String,
    pub negotiation: u64,
    pub signal: PeerSignal,
}

/// Where negotiations deliver their events
pub(crate) type PeerInputSink = Arc<dyn Fn(PeerInput) + Send + Sync>;

/// Result of applying one connection event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerUpdate {
    Pending,
    /// The channel opened; the peer just became ready
    Opened,
    Message(String),
    Closed,
}

fn new_correlation_id() -> String {
    format!("dc_{}", Uuid::new_v4().simple())
}

/// One connected or connecting remote node
pub struct RemotePeer {
    peer_id: String,
    negotiation: u64,
    role: NegotiationRole,
    connection: Box<dyn Connection>,
    channel: Option<Box<dyn DataChannel>>,
    ready: bool,
    /// Offerer: a fresh `dc_<uuid>` sent with the OFFER. Answerer: the id
    /// carried by the offer being answered (or a fresh one if it had none).
    /// Echoed in the ANSWER and on every candidate.
    correlation_id: String,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    timeout_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl RemotePeer {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn negotiation(&self) -> u64 {
        self.negotiation
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn matches(&self, correlation_id: Option<&str>) -> bool {
        correlation_id.map_or(true, |id| id == self.correlation_id)
    }

    /// Send over the channel if it is open
    pub fn send(&self, text: &str) -> Result<(), NetworkError> {
        match &self.channel {
            Some(channel) if self.ready && channel.is_open() => channel.send(text),
            _ => Err(NetworkError::ChannelClosed),
        }
    }

    /// Apply the remote answer to our offer
    pub fn apply_answer(
        &mut self,
        sdp: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), NetworkError> {
        if self.role != NegotiationRole::Offerer || self.remote_description_set {
            return Err(NetworkError::InvalidDescription(format!(
                "unexpected answer from {}",
                self.peer_id
            )));
        }
        if !self.matches(correlation_id) {
            return Err(NetworkError::InvalidDescription(format!(
                "answer from {} for another negotiation",
                self.peer_id
            )));
        }

        self.connection
            .set_remote_description(SessionDescription::answer(sdp))?;
        self.remote_description_set = true;
        debug!("Applied answer from {}", self.peer_id);

        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.connection.add_remote_candidate(candidate)?;
        }
        Ok(())
    }

    /// Apply a remote candidate, holding it until the remote description
    /// is known
    pub fn apply_candidate(
        &mut self,
        candidate: IceCandidate,
        correlation_id: Option<&str>,
    ) -> Result<(), NetworkError> {
        if !self.matches(correlation_id) {
            trace!("Dropping candidate from {} for another negotiation", self.peer_id);
            return Ok(());
        }
        if self.remote_description_set {
            self.connection.add_remote_candidate(candidate)
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// Apply one event the connection reported
    pub(crate) fn handle_event(
        &mut self,
        event: ConnectionEvent,
        signaling: Option<&dyn SignalingTransport>,
    ) -> PeerUpdate {
        match event {
            ConnectionEvent::LocalDescription(description) => {
                let Some(signaling) = signaling else {
                    debug!("No signaling for description to {}", self.peer_id);
                    return PeerUpdate::Pending;
                };
                let sent = match description.kind {
                    SdpType::Offer => {
                        signaling.send_offer(&self.peer_id, &description.sdp, &self.correlation_id)
                    }
                    SdpType::Answer => signaling.send_answer(
                        &self.peer_id,
                        &description.sdp,
                        &self.correlation_id,
                    ),
                };
                match sent {
                    Ok(()) => debug!("Sent {:?} to {}", description.kind, self.peer_id),
                    Err(e) => warn!("Failed to signal {:?} to {}: {}", description.kind, self.peer_id, e),
                }
                PeerUpdate::Pending
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                if let Some(signaling) = signaling {
                    if let Err(e) =
                        signaling.send_candidate(&self.peer_id, &candidate, &self.correlation_id)
                    {
                        debug!("Failed to signal candidate to {}: {}", self.peer_id, e);
                    }
                }
                PeerUpdate::Pending
            }
            ConnectionEvent::StateChanged(state) => {
                trace!("Connection to {} is {:?}", self.peer_id, state);
                if state.is_terminal() {
                    PeerUpdate::Closed
                } else {
                    PeerUpdate::Pending
                }
            }
            ConnectionEvent::DataChannel(channel) => {
                debug!("Inbound channel {} from {}", channel.label(), self.peer_id);
                self.channel = Some(channel);
                PeerUpdate::Pending
            }
            ConnectionEvent::ChannelOpen => {
                if self.ready {
                    return PeerUpdate::Pending;
                }
                self.ready = true;
                if let Some(task) = self.timeout_task.take() {
                    task.abort();
                }
                info!("Channel to {} open", self.peer_id);
                PeerUpdate::Opened
            }
            ConnectionEvent::ChannelMessage(text) => PeerUpdate::Message(text),
            ConnectionEvent::ChannelClosed => PeerUpdate::Closed,
        }
    }

    /// Close the channel and the connection. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.connection.close();
        debug!("Closed connection to {}", self.peer_id);
    }
}

impl Drop for RemotePeer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates [`RemotePeer`]s and wires their callbacks back to the session
pub(crate) struct ConnectionNegotiator {
    connector: Arc<dyn Connector>,
    deliver: PeerInputSink,
    timeout: Duration,
    next_negotiation: u64,
}

impl ConnectionNegotiator {
    pub(crate) fn new(connector: Arc<dyn Connector>, deliver: PeerInputSink, timeout: Duration) -> Self {
        Self {
            connector,
            deliver,
            timeout,
            next_negotiation: 0,
        }
    }

    /// Allocate a negotiation number, its connection sink and its timer
    fn begin(&mut self, peer_id: &str) -> (u64, ConnectionSink, JoinHandle<()>) {
        self.next_negotiation += 1;
        let negotiation = self.next_negotiation;

        let deliver = self.deliver.clone();
        let id = peer_id.to_string();
        let sink = ConnectionSink::new(move |event| {
            deliver(PeerInput {
                peer_id: id.clone(),
                negotiation,
                signal: PeerSignal::Connection(event),
            })
        });

        let deliver = self.deliver.clone();
        let id = peer_id.to_string();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deliver(PeerInput {
                peer_id: id,
                negotiation,
                signal: PeerSignal::Timeout,
            });
        });

        (negotiation, sink, timer)
    }

    /// Start a negotiation as the offering side
    pub(crate) fn initiate(&mut self, peer_id: &str) -> Result<RemotePeer, NetworkError> {
        let (negotiation, sink, timer) = self.begin(peer_id);
        let mut connection = match self.connector.create(sink) {
            Ok(connection) => connection,
            Err(e) => {
                timer.abort();
                return Err(e);
            }
        };
        let channel = match connection.create_data_channel(DATA_CHANNEL_LABEL) {
            Ok(channel) => channel,
            Err(e) => {
                timer.abort();
                connection.close();
                return Err(e);
            }
        };

        info!("Negotiating with {} as offerer", peer_id);
        Ok(RemotePeer {
            peer_id: peer_id.to_string(),
            negotiation,
            role: NegotiationRole::Offerer,
            connection,
            channel: Some(channel),
            ready: false,
            correlation_id: new_correlation_id(),
            remote_description_set: false,
            pending_candidates: Vec::new(),
            timeout_task: Some(timer),
            closed: false,
        })
    }

    /// Answer an inbound offer
    pub(crate) fn respond(
        &mut self,
        peer_id: &str,
        sdp: &str,
        correlation_id: Option<String>,
    ) -> Result<RemotePeer, NetworkError> {
        let (negotiation, sink, timer) = self.begin(peer_id);
        let mut connection = match self.connector.create(sink) {
            Ok(connection) => connection,
            Err(e) => {
                timer.abort();
                return Err(e);
            }
        };
        if let Err(e) = connection.set_remote_description(SessionDescription::offer(sdp)) {
            timer.abort();
            connection.close();
            return Err(e);
        }

        info!("Negotiating with {} as answerer", peer_id);
        Ok(RemotePeer {
            peer_id: peer_id.to_string(),
            negotiation,
            role: NegotiationRole::Answerer,
            connection,
            channel: None,
            ready: false,
            correlation_id: correlation_id.unwrap_or_else(new_correlation_id),
            remote_description_set: true,
            pending_candidates: Vec::new(),
            timeout_task: Some(timer),
            closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::ConnectionState;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Connection that records what the negotiator does to it
    struct RecordingConnection {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Connection for RecordingConnection {
        fn create_data_channel(
            &mut self,
            label: &str,
        ) -> Result<Box<dyn DataChannel>, NetworkError> {
            self.log.lock().push(format!("channel {}", label));
            Ok(Box::new(NullChannel))
        }

        fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<(), NetworkError> {
            self.log
                .lock()
                .push(format!("remote {:?} {}", description.kind, description.sdp));
            Ok(())
        }

        fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NetworkError> {
            self.log.lock().push(format!("candidate {}", candidate.candidate));
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().push("close".to_string());
        }
    }

    struct NullChannel;

    impl DataChannel for NullChannel {
        fn label(&self) -> &str {
            DATA_CHANNEL_LABEL
        }

        fn is_open(&self) -> bool {
            true
        }

        fn send(&self, _message: &str) -> Result<(), NetworkError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct RecordingConnector {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Connector for RecordingConnector {
        fn create(&self, _sink: ConnectionSink) -> Result<Box<dyn Connection>, NetworkError> {
            Ok(Box::new(RecordingConnection {
                log: self.log.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSignaling {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl SignalingTransport for RecordingSignaling {
        fn connect(&mut self, _preferred_id: Option<String>) -> Result<(), NetworkError> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn send_offer(&self, target: &str, sdp: &str, correlation_id: &str) -> Result<(), NetworkError> {
            self.sent
                .lock()
                .push(("offer".to_string(), format!("{} {}", target, sdp), correlation_id.to_string()));
            Ok(())
        }

        fn send_answer(&self, target: &str, sdp: &str, correlation_id: &str) -> Result<(), NetworkError> {
            self.sent
                .lock()
                .push(("answer".to_string(), format!("{} {}", target, sdp), correlation_id.to_string()));
            Ok(())
        }

        fn send_candidate(
            &self,
            target: &str,
            candidate: &IceCandidate,
            correlation_id: &str,
        ) -> Result<(), NetworkError> {
            self.sent.lock().push((
                "candidate".to_string(),
                format!("{} {}", target, candidate.candidate),
                correlation_id.to_string(),
            ));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn local_id(&self) -> Option<String> {
            Some("me".to_string())
        }
    }

    fn negotiator(
        timeout: Duration,
    ) -> (
        ConnectionNegotiator,
        Arc<Mutex<Vec<String>>>,
        mpsc::UnboundedReceiver<PeerInput>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let deliver: PeerInputSink = Arc::new(move |input| {
            let _ = tx.send(input);
        });
        let connector = Arc::new(RecordingConnector { log: log.clone() });
        (ConnectionNegotiator::new(connector, deliver, timeout), log, rx)
    }

    #[tokio::test]
    async fn test_offer_is_signaled_with_correlation_id() {
        let (mut negotiator, log, _rx) = negotiator(Duration::from_secs(30));
        let signaling = RecordingSignaling::default();

        let mut peer = negotiator.initiate("HOST").unwrap();
        assert_eq!(peer.role(), NegotiationRole::Offerer);
        assert!(peer.correlation_id().starts_with("dc_"));
        assert_eq!(log.lock()[0], format!("channel {}", DATA_CHANNEL_LABEL));

        let update = peer.handle_event(
            ConnectionEvent::LocalDescription(SessionDescription::offer("o")),
            Some(&signaling),
        );
        assert_eq!(update, PeerUpdate::Pending);
        let sent = signaling.sent.lock().clone();
        assert_eq!(
            sent,
            vec![(
                "offer".to_string(),
                "HOST o".to_string(),
                peer.correlation_id().to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_candidates_wait_for_answer() {
        let (mut negotiator, log, _rx) = negotiator(Duration::from_secs(30));
        let mut peer = negotiator.initiate("b").unwrap();
        let id = peer.correlation_id().to_string();

        peer.apply_candidate(IceCandidate::new("early", "0"), Some(&id))
            .unwrap();
        assert!(!log.lock().iter().any(|entry| entry == "candidate early"));

        // Answer for a different negotiation is refused
        assert!(peer.apply_answer("a", Some("dc_other")).is_err());

        peer.apply_answer("a", Some(&id)).unwrap();
        peer.apply_candidate(IceCandidate::new("late", "0"), None)
            .unwrap();
        peer.apply_candidate(IceCandidate::new("stale", "0"), Some("dc_other"))
            .unwrap();

        let entries = log.lock().clone();
        assert_eq!(
            &entries[1..],
            &[
                "remote Answer a".to_string(),
                "candidate early".to_string(),
                "candidate late".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_answer_echoes_offer_correlation_id() {
        let (mut negotiator, _log, _rx) = negotiator(Duration::from_secs(30));
        let signaling = RecordingSignaling::default();

        let mut peer = negotiator
            .respond("joiner", "o", Some("dc_theirs".to_string()))
            .unwrap();
        assert_eq!(peer.role(), NegotiationRole::Answerer);
        peer.handle_event(
            ConnectionEvent::LocalDescription(SessionDescription::answer("a")),
            Some(&signaling),
        );
        peer.handle_event(
            ConnectionEvent::LocalCandidate(IceCandidate::new("tcp 127.0.0.1 1", "0")),
            Some(&signaling),
        );

        let sent = signaling.sent.lock().clone();
        assert_eq!(sent[0].0, "answer");
        assert_eq!(sent[0].2, "dc_theirs");
        assert_eq!(sent[1].0, "candidate");
        assert_eq!(sent[1].2, "dc_theirs");
    }

    #[tokio::test]
    async fn test_ready_only_on_channel_open() {
        let (mut negotiator, log, _rx) = negotiator(Duration::from_secs(30));
        let mut peer = negotiator.respond("joiner", "o", None).unwrap();

        assert_eq!(
            peer.handle_event(ConnectionEvent::StateChanged(ConnectionState::Connected), None),
            PeerUpdate::Pending
        );
        assert!(!peer.is_ready());
        assert!(peer.send("x").is_err());

        peer.handle_event(ConnectionEvent::DataChannel(Box::new(NullChannel)), None);
        assert_eq!(
            peer.handle_event(ConnectionEvent::ChannelOpen, None),
            PeerUpdate::Opened
        );
        assert!(peer.is_ready());
        assert!(peer.send("x").is_ok());
        assert_eq!(
            peer.handle_event(ConnectionEvent::ChannelClosed, None),
            PeerUpdate::Closed
        );

        drop(peer);
        assert_eq!(log.lock().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_timeout_is_delivered_with_negotiation() {
        let (mut negotiator, _log, mut rx) = negotiator(Duration::from_millis(20));
        let first = negotiator.initiate("a").unwrap();
        let second = negotiator.initiate("a").unwrap();
        assert_ne!(first.negotiation(), second.negotiation());
        drop(first);

        let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(input.peer_id, "a");
        assert_eq!(input.negotiation, second.negotiation());
        assert!(matches!(input.signal, PeerSignal::Timeout));
    }
}
