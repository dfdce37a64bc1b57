//! Network session
//!
//! [`NetworkSession`] is a handle to one participant's room membership. All
//! session state lives in a single actor task: public calls, signaling
//! callbacks and connection callbacks are queued as [`SessionInput`]s and
//! applied there one at a time, in arrival order. Observable properties
//! are published into a snapshot after every input.
//!
//! ```text
//! Disconnected --create/join--> Connecting --room ready--> Connected
//! Connecting | Connected --signaling failure--> Error
//! any --leave--> Disconnected
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::code::{encode_lan_code, generate_cloud_code, is_cloud_code_format, NetworkCode};
use super::connection::Connector;
use super::envelope::{self, EnvelopeKind, Frame, MessageEnvelope, SystemNotice};
use super::error::NetworkError;
use super::negotiator::{ConnectionNegotiator, NegotiationRole, PeerInput, PeerInputSink, PeerSignal, PeerUpdate, RemotePeer};
use super::signaling::{
    advertised_lan_ip, CloudSignaling, LocalSignaling, LocalSignalingServer, SignalingEvent,
    SignalingMode, SignalingSink, SignalingTransport, LOCAL_HOST_ID,
};
use super::tcp::TcpConnector;
use super::topology::{NoticeAction, Topology, TopologyController};
use crate::config::{clamp_max_nodes, NetworkConfig};

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events reported to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomCreated(String),
    PlayerJoined(String),
    PlayerLeft(String),
    MessageReceived { from: String, data: Value },
    StateReceived { from: String, data: Value },
    ErrorOccurred(String),
    StatusChanged(SessionStatus),
}

/// Observable session properties
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub room_code: String,
    pub local_node_id: String,
    pub is_host: bool,
    pub status: SessionStatus,
    /// Remote nodes in the room, in join order
    pub nodes: Vec<String>,
    pub max_nodes: usize,
    pub topology: Topology,
    pub auto_relay: bool,
    pub signaling_mode: SignalingMode,
}

impl SessionSnapshot {
    fn from_config(config: &NetworkConfig) -> Self {
        Self {
            room_code: String::new(),
            local_node_id: String::new(),
            is_host: false,
            status: SessionStatus::Disconnected,
            nodes: Vec::new(),
            max_nodes: config.max_nodes,
            topology: config.topology,
            auto_relay: config.auto_relay,
            signaling_mode: config.signaling_mode,
        }
    }
}

enum Command {
    CreateRoom,
    JoinRoom(String),
    Leave,
    Send {
        target: Option<String>,
        envelope: MessageEnvelope,
    },
    SetMaxNodes(usize),
    SetTopology(Topology),
    SetAutoRelay(bool),
    SetSignalingMode(SignalingMode),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Everything the session actor reacts to
enum SessionInput {
    Command(Command),
    Signaling {
        generation: u64,
        event: SignalingEvent,
    },
    Peer(PeerInput),
}

/// Handle to a network session.
///
/// Operations return immediately; their outcome is observed through
/// [`SessionEvent`]s and the property getters. Dropping the handle leaves
/// the room.
pub struct NetworkSession {
    inputs: mpsc::UnboundedSender<SessionInput>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl NetworkSession {
    /// Start a session actor. Must be called inside a tokio runtime.
    pub fn new(
        mut config: NetworkConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        config.max_nodes = clamp_max_nodes(config.max_nodes as i64);

        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::from_config(&config)));

        let peer_tx = inputs.clone();
        let deliver: PeerInputSink = Arc::new(move |input| {
            let _ = peer_tx.send(SessionInput::Peer(input));
        });

        let actor = SessionActor {
            negotiator: ConnectionNegotiator::new(connector, deliver, config.negotiation_timeout()),
            topology: TopologyController::new(config.topology, config.auto_relay),
            config,
            inputs: inputs.clone(),
            events,
            snapshot: snapshot.clone(),
            status: SessionStatus::Disconnected,
            room_code: String::new(),
            pending_code: None,
            local_id: String::new(),
            is_host: false,
            host_peer_id: None,
            signaling: None,
            signaling_generation: 0,
            local_server: None,
            peers: HashMap::new(),
            nodes: Vec::new(),
            members: Vec::new(),
        };
        tokio::spawn(actor.run(inputs_rx));

        (Self { inputs, snapshot }, events_rx)
    }

    /// Session using the direct TCP transport
    pub fn with_tcp_transport(
        config: NetworkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let connector = Arc::new(TcpConnector::new(config.transport.clone()));
        Self::new(config, connector)
    }

    fn command(&self, command: Command) {
        if self.inputs.send(SessionInput::Command(command)).is_err() {
            warn!("Session task is gone, command dropped");
        }
    }

    /// Host a new room. Leaves the current room first, if any.
    pub fn create_room(&self) {
        self.command(Command::CreateRoom);
    }

    /// Join the room behind `code`. Leaves the current room first, if any.
    pub fn join_room(&self, code: &str) {
        self.command(Command::JoinRoom(code.to_string()));
    }

    /// Leave the room. Idempotent.
    pub fn leave(&self) {
        self.command(Command::Leave);
    }

    /// Send an application message to every ready peer
    pub fn broadcast(&self, data: Value) {
        self.command(Command::Send {
            target: None,
            envelope: MessageEnvelope::message(data),
        });
    }

    /// Send a replaceable state update to every ready peer
    pub fn broadcast_state(&self, data: Value) {
        self.command(Command::Send {
            target: None,
            envelope: MessageEnvelope::state(data),
        });
    }

    /// Send an application message to one peer. Unknown or unready peers
    /// are ignored.
    pub fn send_to(&self, peer_id: &str, data: Value) {
        self.command(Command::Send {
            target: Some(peer_id.to_string()),
            envelope: MessageEnvelope::message(data),
        });
    }

    /// Set the room size, clamped to [2, 8]. Returns the applied value.
    pub fn set_max_nodes(&self, requested: i64) -> usize {
        let max_nodes = clamp_max_nodes(requested);
        self.command(Command::SetMaxNodes(max_nodes));
        max_nodes
    }

    /// Topology used by the next room created or joined
    pub fn set_topology(&self, topology: Topology) {
        self.command(Command::SetTopology(topology));
    }

    pub fn set_auto_relay(&self, auto_relay: bool) {
        self.command(Command::SetAutoRelay(auto_relay));
    }

    /// Signaling used by the next room created
    pub fn set_signaling_mode(&self, mode: SignalingMode) {
        self.command(Command::SetSignalingMode(mode));
    }

    /// Wait until every call made before this one has been applied
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Flush(tx));
        let _ = rx.await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn room_code(&self) -> String {
        self.snapshot.read().room_code.clone()
    }

    pub fn local_node_id(&self) -> String {
        self.snapshot.read().local_node_id.clone()
    }

    pub fn is_host(&self) -> bool {
        self.snapshot.read().is_host
    }

    pub fn connected(&self) -> bool {
        self.snapshot.read().status == SessionStatus::Connected
    }

    pub fn node_count(&self) -> usize {
        self.snapshot.read().nodes.len()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.snapshot.read().nodes.clone()
    }

    pub fn max_nodes(&self) -> usize {
        self.snapshot.read().max_nodes
    }

    pub fn topology(&self) -> Topology {
        self.snapshot.read().topology
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.read().status
    }

    pub fn auto_relay(&self) -> bool {
        self.snapshot.read().auto_relay
    }

    pub fn signaling_mode(&self) -> SignalingMode {
        self.snapshot.read().signaling_mode
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        let _ = self.inputs.send(SessionInput::Command(Command::Shutdown));
    }
}

/// Owner of all session state. Runs on one task.
struct SessionActor {
    config: NetworkConfig,
    inputs: mpsc::UnboundedSender<SessionInput>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    negotiator: ConnectionNegotiator,
    /// Policy of the current room
    topology: TopologyController,
    status: SessionStatus,
    room_code: String,
    /// Code of a room being created, until signaling confirms it
    pending_code: Option<String>,
    local_id: String,
    is_host: bool,
    /// Joiners only
    host_peer_id: Option<String>,
    signaling: Option<Box<dyn SignalingTransport>>,
    /// Bumped whenever signaling is replaced; older events are stale
    signaling_generation: u64,
    local_server: Option<LocalSignalingServer>,
    peers: HashMap<String, RemotePeer>,
    nodes: Vec<String>,
    /// Star members reached through the host (joiners only)
    members: Vec<String>,
}

impl SessionActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                SessionInput::Command(Command::Shutdown) => {
                    self.leave();
                    break;
                }
                SessionInput::Command(command) => self.handle_command(command),
                SessionInput::Signaling { generation, event } => {
                    if generation == self.signaling_generation && self.signaling.is_some() {
                        self.handle_signaling(event);
                    } else {
                        trace!("Dropping stale signaling event {:?}", event);
                    }
                }
                SessionInput::Peer(input) => self.handle_peer_input(input),
            }
            self.publish();
        }
        debug!("Session task finished");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateRoom => self.create_room(),
            Command::JoinRoom(code) => self.join_room(&code),
            Command::Leave => self.leave(),
            Command::Send { target, envelope } => self.send_envelope(target, &envelope),
            Command::SetMaxNodes(max_nodes) => self.config.max_nodes = max_nodes,
            Command::SetTopology(topology) => {
                if self.status != SessionStatus::Disconnected {
                    info!("Topology {:?} applies from the next room", topology);
                }
                self.config.topology = topology;
            }
            Command::SetAutoRelay(auto_relay) => {
                self.config.auto_relay = auto_relay;
                self.topology.set_auto_relay(auto_relay);
            }
            Command::SetSignalingMode(mode) => self.config.signaling_mode = mode,
            Command::Flush(done) => {
                self.publish();
                let _ = done.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!("Session status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn publish(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.room_code.clone_from(&self.room_code);
        snapshot.local_node_id.clone_from(&self.local_id);
        snapshot.is_host = self.is_host;
        snapshot.status = self.status;
        snapshot.nodes.clone_from(&self.nodes);
        snapshot.max_nodes = self.config.max_nodes;
        snapshot.topology = self.config.topology;
        snapshot.auto_relay = self.config.auto_relay;
        snapshot.signaling_mode = self.config.signaling_mode;
    }

    /// Sink for a new signaling transport; invalidates the previous one
    fn next_signaling_sink(&mut self) -> SignalingSink {
        self.signaling_generation += 1;
        let generation = self.signaling_generation;
        let tx = self.inputs.clone();
        SignalingSink::new(move |event| {
            let _ = tx.send(SessionInput::Signaling { generation, event });
        })
    }

    fn begin_room(&mut self) {
        if self.status != SessionStatus::Disconnected {
            info!("Leaving current room first");
            self.leave();
        }
        self.topology = TopologyController::new(self.config.topology, self.config.auto_relay);
        self.set_status(SessionStatus::Connecting);
    }

    fn create_room(&mut self) {
        self.begin_room();

        let sink = self.next_signaling_sink();
        let started = match self.config.signaling_mode {
            SignalingMode::Local => self.start_local_host(sink),
            SignalingMode::Cloud => {
                let code = generate_cloud_code();
                let mut signaling = CloudSignaling::new(&self.config.cloud, sink);
                signaling
                    .connect(Some(code.clone()))
                    .map(|()| (code, Box::new(signaling) as Box<dyn SignalingTransport>))
            }
        };

        match started {
            Ok((code, signaling)) => {
                info!("Creating {:?} room {}", self.config.topology, code);
                self.pending_code = Some(code);
                self.signaling = Some(signaling);
            }
            Err(e) => self.fail(format!("Failed to create room: {}", e)),
        }
    }

    /// Start the discovery server and register on it as the host
    fn start_local_host(
        &mut self,
        sink: SignalingSink,
    ) -> Result<(String, Box<dyn SignalingTransport>), NetworkError> {
        let local = &self.config.local;
        let server = LocalSignalingServer::bind(SocketAddr::new(local.bind_ip, local.port))?;
        let code = encode_lan_code(advertised_lan_ip(local), server.port());

        let connect_ip = match local.bind_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let mut signaling = LocalSignaling::new(SocketAddr::new(connect_ip, server.port()), sink);
        signaling.connect(Some(LOCAL_HOST_ID.to_string()))?;

        self.local_server = Some(server);
        Ok((code, Box::new(signaling)))
    }

    fn join_room(&mut self, code: &str) {
        self.begin_room();

        let code = NetworkCode::parse(code);
        if let NetworkCode::Cloud(raw) = &code {
            if !is_cloud_code_format(raw) {
                warn!("{}, trying it as a cloud room", NetworkError::InvalidCode(raw.clone()));
            }
        }

        let sink = self.next_signaling_sink();
        let mut signaling: Box<dyn SignalingTransport> = match &code {
            NetworkCode::Lan(addr) => Box::new(LocalSignaling::new(SocketAddr::V4(*addr), sink)),
            NetworkCode::Cloud(_) => Box::new(CloudSignaling::new(&self.config.cloud, sink)),
        };

        info!("Joining room {}", code);
        self.room_code = code.to_string();
        self.host_peer_id = Some(TopologyController::host_peer_id(&code));

        match signaling.connect(None) {
            Ok(()) => self.signaling = Some(signaling),
            Err(e) => self.fail(format!("Failed to join room: {}", e)),
        }
    }

    fn close_signaling(&mut self) {
        if let Some(mut signaling) = self.signaling.take() {
            signaling.disconnect();
        }
        self.signaling_generation += 1;
        if let Some(server) = self.local_server.take() {
            server.stop();
        }
    }

    fn close_peers(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.close();
        }
        self.nodes.clear();
        self.members.clear();
    }

    fn leave(&mut self) {
        let idle = self.status == SessionStatus::Disconnected
            && self.signaling.is_none()
            && self.local_server.is_none()
            && self.peers.is_empty();
        if idle {
            trace!("Leave while disconnected");
            return;
        }

        info!("Leaving room {}", self.room_code);
        self.close_peers();
        self.close_signaling();
        self.room_code.clear();
        self.pending_code = None;
        self.local_id.clear();
        self.is_host = false;
        self.host_peer_id = None;
        self.set_status(SessionStatus::Disconnected);
    }

    /// Move to Error. A room still being set up is torn down; an
    /// established one keeps its peers.
    fn fail(&mut self, message: String) {
        error!("Session error: {}", message);
        let was_connecting = self.status == SessionStatus::Connecting;
        self.close_signaling();
        if was_connecting {
            self.close_peers();
            self.pending_code = None;
        }
        self.set_status(SessionStatus::Error);
        self.emit(SessionEvent::ErrorOccurred(message));
    }

    fn ready_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_ready()).count()
    }

    /// Peers holding a slot: open channels plus offers we already answered
    fn committed_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.is_ready() || peer.role() == NegotiationRole::Answerer)
            .count()
    }

    fn is_host_link(&self, peer_id: &str) -> bool {
        !self.is_host && self.host_peer_id.as_deref() == Some(peer_id)
    }

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected(id) => self.on_signaling_connected(id),
            SignalingEvent::OfferReceived {
                from,
                sdp,
                correlation_id,
            } => self.on_offer(from, &sdp, correlation_id),
            SignalingEvent::AnswerReceived {
                from,
                sdp,
                correlation_id,
            } => match self.peers.get_mut(&from) {
                Some(peer) => {
                    if let Err(e) = peer.apply_answer(&sdp, correlation_id.as_deref()) {
                        debug!("Ignoring answer from {}: {}", from, e);
                    }
                }
                None => debug!("Answer from unknown peer {}", from),
            },
            SignalingEvent::CandidateReceived {
                from,
                candidate,
                correlation_id,
            } => match self.peers.get_mut(&from) {
                Some(peer) => {
                    if let Err(e) = peer.apply_candidate(candidate, correlation_id.as_deref()) {
                        warn!("Failed to apply candidate from {}: {}", from, e);
                    }
                }
                None => trace!("Candidate from unknown peer {}", from),
            },
            SignalingEvent::PeerUnavailable { peer_id } => self.on_peer_unavailable(&peer_id),
            SignalingEvent::Error(message) => self.fail(message),
            SignalingEvent::Closed => self.fail("Signaling connection closed".to_string()),
        }
    }

    fn on_signaling_connected(&mut self, id: String) {
        self.local_id = id;

        if let Some(code) = self.pending_code.take() {
            self.is_host = true;
            self.room_code.clone_from(&code);
            self.set_status(SessionStatus::Connected);
            info!("Room {} created", code);
            self.emit(SessionEvent::RoomCreated(code));
        } else if let Some(host) = self.host_peer_id.clone() {
            info!("Signaling ready, connecting to host {}", host);
            self.initiate(&host);
        }
    }

    fn initiate(&mut self, peer_id: &str) {
        match self.negotiator.initiate(peer_id) {
            Ok(peer) => {
                self.peers.insert(peer_id.to_string(), peer);
            }
            Err(e) => {
                warn!("Failed to start negotiation with {}: {}", peer_id, e);
                if self.is_host_link(peer_id) && self.status == SessionStatus::Connecting {
                    self.fail(format!("Failed to connect to host: {}", e));
                }
            }
        }
    }

    fn on_offer(&mut self, from: String, sdp: &str, correlation_id: Option<String>) {
        if from == self.local_id {
            return;
        }
        if !self.topology.accepts_offers(self.is_host) {
            warn!("Ignoring offer from {}: star members only connect to the host", from);
            return;
        }

        if let Some(existing) = self.peers.get(&from) {
            if existing.is_ready() {
                warn!("Ignoring offer from already connected {}", from);
                return;
            }
            if existing.role() == NegotiationRole::Offerer {
                if TopologyController::keeps_own_offer(&self.local_id, &from) {
                    debug!("Offer collision with {}, keeping ours", from);
                    return;
                }
                debug!("Offer collision with {}, answering theirs", from);
            }
            self.peers.remove(&from);
        }

        let max_nodes = self.config.max_nodes;
        if self.committed_count() >= max_nodes.saturating_sub(1) {
            warn!(
                "Rejecting offer from {}: {}",
                from,
                NetworkError::CapacityExceeded { max_nodes }
            );
            return;
        }

        match self.negotiator.respond(&from, sdp, correlation_id) {
            Ok(peer) => {
                self.peers.insert(from, peer);
            }
            Err(e) => warn!(
                "{}",
                NetworkError::NegotiationFailed {
                    peer: from,
                    reason: e.to_string(),
                }
            ),
        }
    }

    fn on_peer_unavailable(&mut self, peer_id: &str) {
        if self.is_host_link(peer_id) && self.status == SessionStatus::Connecting {
            self.fail("Room not found".to_string());
            return;
        }
        if self.peers.get(peer_id).is_some_and(|peer| !peer.is_ready()) {
            debug!("{} is unreachable through signaling", peer_id);
            self.remove_peer(peer_id);
        }
    }

    fn handle_peer_input(&mut self, input: PeerInput) {
        let PeerInput {
            peer_id,
            negotiation,
            signal,
        } = input;

        let Some(peer) = self
            .peers
            .get_mut(&peer_id)
            .filter(|peer| peer.negotiation() == negotiation)
        else {
            trace!("Dropping event for stale negotiation {} with {}", negotiation, peer_id);
            return;
        };

        match signal {
            PeerSignal::Timeout => {
                if !peer.is_ready() {
                    warn!("Negotiation with {} timed out", peer_id);
                    self.remove_peer(&peer_id);
                }
            }
            PeerSignal::Connection(event) => {
                match peer.handle_event(event, self.signaling.as_deref()) {
                    PeerUpdate::Pending => {}
                    PeerUpdate::Opened => self.on_peer_ready(&peer_id),
                    PeerUpdate::Message(text) => self.on_channel_message(&peer_id, &text),
                    PeerUpdate::Closed => self.remove_peer(&peer_id),
                }
            }
        }
    }

    fn on_peer_ready(&mut self, peer_id: &str) {
        let max_nodes = self.config.max_nodes;
        if self.is_host
            && !self.nodes.iter().any(|node| node == peer_id)
            && self.nodes.len() >= max_nodes.saturating_sub(1)
        {
            warn!(
                "Dropping {}: {}",
                peer_id,
                NetworkError::CapacityExceeded { max_nodes }
            );
            if let Some(mut peer) = self.peers.remove(peer_id) {
                peer.close();
            }
            return;
        }

        self.members.retain(|member| member != peer_id);
        if !self.nodes.iter().any(|node| node == peer_id) {
            self.nodes.push(peer_id.to_string());
        }
        info!("Peer {} joined", peer_id);
        self.emit(SessionEvent::PlayerJoined(peer_id.to_string()));

        if self.is_host {
            let existing: Vec<String> = self
                .nodes
                .iter()
                .filter(|node| *node != peer_id)
                .cloned()
                .collect();
            for (target, notice) in self.topology.join_notices(peer_id, &existing) {
                self.send_notice(&target, &notice);
            }
        } else if self.is_host_link(peer_id) && self.status == SessionStatus::Connecting {
            info!("Joined room {}", self.room_code);
            self.set_status(SessionStatus::Connected);
        }
    }

    fn remove_peer(&mut self, peer_id: &str) {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            return;
        };
        let was_ready = peer.is_ready();
        peer.close();

        if was_ready {
            self.nodes.retain(|node| node != peer_id);
            info!("Peer {} left", peer_id);
            self.emit(SessionEvent::PlayerLeft(peer_id.to_string()));

            if self.is_host {
                let remaining = self.nodes.clone();
                for (target, notice) in self.topology.leave_notices(peer_id, &remaining) {
                    self.send_notice(&target, &notice);
                }
            }
        } else {
            debug!("Negotiation with {} abandoned", peer_id);
            if self.is_host_link(peer_id) && self.status == SessionStatus::Connecting {
                self.fail(format!("Failed to connect to host {}", peer_id));
                return;
            }
        }

        let established = matches!(self.status, SessionStatus::Connected | SessionStatus::Error);
        if !self.is_host && established && self.ready_count() == 0 {
            info!("Lost every connection in room {}", self.room_code);
            self.leave();
        }
    }

    fn on_channel_message(&mut self, from: &str, text: &str) {
        let frame = match envelope::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid message from {}: {}", from, e);
                return;
            }
        };

        match frame {
            Frame::System(notice) => self.on_notice(from, notice),
            Frame::App(envelope) => {
                // Only a host may attribute a message to someone else
                let origin = match &envelope.from {
                    Some(origin) if self.is_host_link(from) => origin.clone(),
                    _ => from.to_string(),
                };
                let data = envelope.data.clone();
                match envelope.kind {
                    EnvelopeKind::Message => {
                        self.emit(SessionEvent::MessageReceived { from: origin, data })
                    }
                    EnvelopeKind::State => {
                        self.emit(SessionEvent::StateReceived { from: origin, data })
                    }
                }

                if self.topology.should_relay(self.is_host) {
                    self.relay(from, &envelope);
                }
            }
        }
    }

    fn on_notice(&mut self, from: &str, notice: SystemNotice) {
        if !self.is_host_link(from) {
            debug!("Ignoring notice from non-host {}", from);
            return;
        }

        match self.topology.on_notice(notice, &self.local_id) {
            NoticeAction::Connect(nodes) => {
                for node in nodes {
                    if !self.peers.contains_key(&node) {
                        self.initiate(&node);
                    }
                }
            }
            NoticeAction::MemberJoined(member) => {
                if !self.nodes.contains(&member) {
                    self.nodes.push(member.clone());
                    self.members.push(member.clone());
                    info!("Member {} joined through the host", member);
                    self.emit(SessionEvent::PlayerJoined(member));
                }
            }
            NoticeAction::MemberLeft(member) => {
                if let Some(pos) = self.members.iter().position(|m| *m == member) {
                    self.members.remove(pos);
                    self.nodes.retain(|node| *node != member);
                    info!("Member {} left", member);
                    self.emit(SessionEvent::PlayerLeft(member));
                }
            }
            NoticeAction::Ignore => {}
        }
    }

    fn send_notice(&self, target: &str, notice: &SystemNotice) {
        let text = match envelope::encode_notice(notice) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode notice: {}", e);
                return;
            }
        };
        match self.peers.get(target) {
            Some(peer) => {
                if let Err(e) = peer.send(&text) {
                    debug!("Failed to send notice to {}: {}", target, e);
                }
            }
            None => debug!("No channel to {} for notice", target),
        }
    }

    fn relay(&self, origin: &str, envelope: &MessageEnvelope) {
        let text = match envelope::encode(&envelope.relayed_from(origin)) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode relayed message: {}", e);
                return;
            }
        };
        let ready: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| self.peers.get(*node).is_some_and(|peer| peer.is_ready()))
            .cloned()
            .collect();
        for target in self.topology.relay_targets(origin, &ready) {
            if let Some(peer) = self.peers.get(target) {
                if let Err(e) = peer.send(&text) {
                    debug!("Relay to {} failed: {}", target, e);
                }
            }
        }
    }

    fn send_envelope(&self, target: Option<String>, envelope: &MessageEnvelope) {
        let text = match envelope::encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                return;
            }
        };

        match target {
            None => {
                for peer in self.peers.values().filter(|peer| peer.is_ready()) {
                    if let Err(e) = peer.send(&text) {
                        debug!("Send to {} failed: {}", peer.peer_id(), e);
                    }
                }
            }
            Some(peer_id) => match self.peers.get(&peer_id) {
                Some(peer) if peer.is_ready() => {
                    if let Err(e) = peer.send(&text) {
                        debug!("Send to {} failed: {}", peer_id, e);
                    }
                }
                _ => debug!("{}", NetworkError::PeerNotFound(peer_id)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudConfig, LocalConfig, TransportConfig};
    use crate::network::code::decode_lan_code;
    use crate::network::connection::{
        Connection, ConnectionEvent, ConnectionSink, DataChannel, IceCandidate, SdpType, SessionDescription,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    /// Connection that answers offers but never opens a channel
    struct StalledConnection {
        sink: ConnectionSink,
    }

    impl Connection for StalledConnection {
        fn create_data_channel(&mut self, _label: &str) -> Result<Box<dyn DataChannel>, NetworkError> {
            Err(NetworkError::ChannelClosed)
        }

        fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<(), NetworkError> {
            if description.kind == SdpType::Offer {
                self.sink
                    .emit(ConnectionEvent::LocalDescription(SessionDescription::answer("stalled")));
            }
            Ok(())
        }

        fn add_remote_candidate(&mut self, _candidate: IceCandidate) -> Result<(), NetworkError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct StalledConnector;

    impl Connector for StalledConnector {
        fn create(&self, sink: ConnectionSink) -> Result<Box<dyn Connection>, NetworkError> {
            Ok(Box::new(StalledConnection { sink }))
        }
    }

    /// Host a LAN room whose connections never open
    async fn stalled_host(
        max_nodes: usize,
        negotiation_timeout_ms: u64,
    ) -> (NetworkSession, mpsc::UnboundedReceiver<SessionEvent>, SocketAddr) {
        let config = NetworkConfig {
            signaling_mode: SignalingMode::Local,
            max_nodes,
            negotiation_timeout_ms,
            ..loopback_config()
        };
        let (host, mut events) = NetworkSession::new(config, Arc::new(StalledConnector));
        host.create_room();
        let SessionEvent::RoomCreated(code) =
            wait_for(&mut events, |e| matches!(e, SessionEvent::RoomCreated(_))).await
        else {
            unreachable!()
        };
        host.flush().await;
        let (ip, port) = decode_lan_code(&code).unwrap();
        (host, events, SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// A bare signaling client registered on the host's discovery server
    async fn signaling_peer(
        server: SocketAddr,
    ) -> (LocalSignaling, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (sink, mut rx) = SignalingSink::channel();
        let mut signaling = LocalSignaling::new(server, sink);
        assert_ok!(signaling.connect(None));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(event, Ok(Some(SignalingEvent::Connected(_)))));
        (signaling, rx)
    }

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            local: LocalConfig {
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..Default::default()
            },
            transport: TransportConfig {
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    #[tokio::test]
    async fn test_set_max_nodes_clamps() {
        let (session, _events) = NetworkSession::with_tcp_transport(NetworkConfig::default());

        assert_eq!(session.set_max_nodes(100), 8);
        assert_eq!(session.set_max_nodes(0), 2);
        session.flush().await;
        assert_eq!(session.max_nodes(), 2);

        assert_eq!(session.set_max_nodes(5), 5);
        session.flush().await;
        assert_eq!(session.max_nodes(), 5);
    }

    #[tokio::test]
    async fn test_leave_while_disconnected_is_silent() {
        let (session, mut events) = NetworkSession::with_tcp_transport(NetworkConfig::default());

        session.leave();
        session.leave();
        session.flush().await;

        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_changes_nothing() {
        let (session, mut events) = NetworkSession::with_tcp_transport(NetworkConfig::default());
        let before = session.snapshot();

        session.send_to("unknown-id", json!({"x": 1}));
        session.broadcast(json!({"x": 1}));
        session.flush().await;

        assert_eq!(session.snapshot(), before);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_local_room() {
        let config = NetworkConfig {
            signaling_mode: SignalingMode::Local,
            ..loopback_config()
        };
        let (session, mut events) = NetworkSession::with_tcp_transport(config);

        session.create_room();
        let created = wait_for(&mut events, |e| matches!(e, SessionEvent::RoomCreated(_))).await;
        session.flush().await;

        let SessionEvent::RoomCreated(code) = created else {
            unreachable!()
        };
        assert!(code.starts_with('L'));
        assert_eq!(session.room_code(), code);
        assert!(session.is_host());
        assert!(session.connected());
        assert_eq!(session.local_node_id(), LOCAL_HOST_ID);
        assert_eq!(session.node_count(), 0);

        let (ip, _port) = crate::network::decode_lan_code(&code).unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);

        session.leave();
        session.flush().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(session.room_code().is_empty());
        assert!(!session.is_host());
    }

    /// Given a broker that accepts TCP but never completes the handshake
    /// When leave() is called while the room is still Connecting
    /// Then the session ends Disconnected with no peers
    #[tokio::test]
    async fn test_leave_while_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = NetworkConfig {
            cloud: CloudConfig {
                url: format!("ws://{}/peerjs", addr),
                ..Default::default()
            },
            ..loopback_config()
        };
        let (session, mut events) = NetworkSession::with_tcp_transport(config);

        session.create_room();
        session.flush().await;
        assert_eq!(session.status(), SessionStatus::Connecting);

        session.leave();
        session.flush().await;

        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.node_count(), 0);
        assert!(session.room_code().is_empty());

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StatusChanged(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![SessionStatus::Connecting, SessionStatus::Disconnected]
        );
        drop(listener);
    }

    /// Given a host whose connection to a joiner never opens
    /// When the negotiation times out
    /// Then the joiner is dropped without PlayerLeft and the room stays up
    #[tokio::test]
    async fn test_negotiation_timeout_is_silent() {
        let (host, mut events, server) = stalled_host(4, 200).await;
        let (joiner, mut joiner_rx) = signaling_peer(server).await;

        assert_ok!(joiner.send_offer(LOCAL_HOST_ID, "offer", "dc_1"));
        let answer = tokio::time::timeout(Duration::from_secs(5), joiner_rx.recv()).await;
        assert!(matches!(
            answer,
            Ok(Some(SignalingEvent::AnswerReceived { correlation_id: Some(ref id), .. })) if id == "dc_1"
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        host.flush().await;

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::PlayerLeft(_) | SessionEvent::PlayerJoined(_)),
                "unexpected {:?}",
                event
            );
        }
        assert_eq!(host.status(), SessionStatus::Connected);
        assert_eq!(host.node_count(), 0);
    }

    /// Given a host with max_nodes = 2 still negotiating with one joiner
    /// When a second joiner offers before the first channel opens
    /// Then only the first offer is answered
    #[tokio::test]
    async fn test_pending_negotiation_holds_capacity() {
        let (host, _events, server) = stalled_host(2, 30_000).await;
        let (first, mut first_rx) = signaling_peer(server).await;
        let (second, mut second_rx) = signaling_peer(server).await;

        assert_ok!(first.send_offer(LOCAL_HOST_ID, "offer", "dc_1"));
        let answer = tokio::time::timeout(Duration::from_secs(5), first_rx.recv()).await;
        assert!(matches!(answer, Ok(Some(SignalingEvent::AnswerReceived { .. }))));

        assert_ok!(second.send_offer(LOCAL_HOST_ID, "offer", "dc_2"));
        let refused = tokio::time::timeout(Duration::from_millis(500), second_rx.recv()).await;
        assert!(refused.is_err(), "second offer was answered: {:?}", refused);

        host.flush().await;
        assert_eq!(host.node_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_error() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = NetworkConfig {
            cloud: CloudConfig {
                url: format!("ws://{}/peerjs", addr),
                ..Default::default()
            },
            ..loopback_config()
        };
        let (session, mut events) = NetworkSession::with_tcp_transport(config);

        session.create_room();
        wait_for(&mut events, |e| matches!(e, SessionEvent::ErrorOccurred(_))).await;
        session.flush().await;

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(!session.connected());
        assert!(!session.is_host());
    }
}
