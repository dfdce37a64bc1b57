//! Direct TCP transport
//!
//! A [`Connector`] that needs no WebRTC stack, usable on a LAN or over any
//! routable path. The offerer listens on an ephemeral port and trickles its
//! addresses as candidates; the answerer dials them in arrival order and
//! proves itself with the token from the offer.
//!
//! ```text
//! offer:      peerlink-tcp/1 offer <token> <label>
//! answer:     peerlink-tcp/1 answer <token>
//! candidate:  tcp <ip> <port>
//! frame:      u32 big-endian length | UTF-8 payload
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::connection::{
    Connection, ConnectionEvent, ConnectionSink, ConnectionState, Connector, DataChannel,
    IceCandidate, SdpType, SessionDescription,
};
use super::error::NetworkError;
use crate::config::TransportConfig;

const PROTOCOL: &str = "peerlink-tcp/1";

/// Media line id used for all candidates
const CANDIDATE_MID: &str = "0";

/// Largest frame accepted on a channel
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// How long an accepted socket has to present the token
const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a listening TCP socket with SO_REUSEADDR enabled
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Allow quick rebind of a fixed port after leave
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Creates [`TcpConnection`]s
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    fn create(&self, sink: ConnectionSink) -> Result<Box<dyn Connection>, NetworkError> {
        Ok(Box::new(TcpConnection::new(self.config.clone(), sink)))
    }
}

/// State shared between a connection, its channel handle and its I/O task
struct ChannelShared {
    open: AtomicBool,
    shutdown: Notify,
}

/// One direct TCP connection
pub struct TcpConnection {
    config: TransportConfig,
    sink: ConnectionSink,
    token: Option<String>,
    is_offerer: bool,
    shared: Arc<ChannelShared>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Option<mpsc::UnboundedReceiver<String>>,
    dial_tx: Option<mpsc::UnboundedSender<SocketAddr>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl TcpConnection {
    fn new(config: TransportConfig, sink: ConnectionSink) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            token: None,
            is_offerer: false,
            shared: Arc::new(ChannelShared {
                open: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            dial_tx: None,
            tasks: Vec::new(),
            closed: false,
        }
    }

    fn channel(&self, label: &str) -> TcpDataChannel {
        TcpDataChannel {
            label: label.to_string(),
            shared: self.shared.clone(),
            outbound: self.outbound_tx.clone(),
        }
    }

    fn take_outbound(&mut self) -> Result<mpsc::UnboundedReceiver<String>, NetworkError> {
        if self.closed || self.token.is_some() {
            return Err(NetworkError::InvalidDescription(
                "negotiation already started".to_string(),
            ));
        }
        self.outbound_rx.take().ok_or(NetworkError::ChannelClosed)
    }
}

impl Connection for TcpConnection {
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>, NetworkError> {
        let outbound_rx = self.take_outbound()?;
        let token = Uuid::new_v4().simple().to_string();
        self.token = Some(token.clone());
        self.is_offerer = true;

        let task = tokio::spawn(run_offerer(
            self.config.clone(),
            self.sink.clone(),
            token,
            label.to_string(),
            self.shared.clone(),
            outbound_rx,
        ));
        self.tasks.push(task);

        Ok(Box::new(self.channel(label)))
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NetworkError> {
        match description.kind {
            SdpType::Offer => {
                let (token, label) = parse_offer(&description.sdp)?;
                let outbound_rx = self.take_outbound()?;
                self.token = Some(token.clone());

                let (dial_tx, dial_rx) = mpsc::unbounded_channel();
                self.dial_tx = Some(dial_tx);

                self.sink
                    .emit(ConnectionEvent::LocalDescription(SessionDescription::answer(
                        format!("{} answer {}", PROTOCOL, token),
                    )));
                self.sink
                    .emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));

                let task = tokio::spawn(run_answerer(
                    self.config.clone(),
                    self.sink.clone(),
                    token,
                    self.channel(&label),
                    dial_rx,
                    self.shared.clone(),
                    outbound_rx,
                ));
                self.tasks.push(task);
                Ok(())
            }
            SdpType::Answer => {
                if !self.is_offerer {
                    return Err(NetworkError::InvalidDescription(
                        "answer without offer".to_string(),
                    ));
                }
                let token = parse_answer(&description.sdp)?;
                if self.token.as_deref() != Some(token.as_str()) {
                    return Err(NetworkError::InvalidDescription(
                        "answer token mismatch".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NetworkError> {
        if self.is_offerer {
            // The answerer dials us; its candidates are not needed
            trace!("Ignoring remote candidate on offering side");
            return Ok(());
        }
        let addr = parse_candidate(&candidate.candidate).ok_or_else(|| {
            NetworkError::InvalidDescription(format!("bad candidate: {}", candidate.candidate))
        })?;
        let dial_tx = self.dial_tx.as_ref().ok_or_else(|| {
            NetworkError::InvalidDescription("candidate before offer".to_string())
        })?;
        dial_tx.send(addr).map_err(|_| NetworkError::ChannelClosed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
        self.dial_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channel handle for a [`TcpConnection`]
pub struct TcpDataChannel {
    label: String,
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<String>,
}

impl DataChannel for TcpDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn send(&self, message: &str) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::ChannelClosed);
        }
        if message.len() > MAX_FRAME_LEN {
            return Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message exceeds frame limit",
            )));
        }
        self.outbound
            .send(message.to_string())
            .map_err(|_| NetworkError::ChannelClosed)
    }

    fn close(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
    }
}

async fn run_offerer(
    config: TransportConfig,
    sink: ConnectionSink,
    token: String,
    label: String,
    shared: Arc<ChannelShared>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let listener = match bind_listener(SocketAddr::new(config.bind_ip, 0)) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind TCP listener: {}", e);
            sink.emit(ConnectionEvent::StateChanged(ConnectionState::Failed));
            return;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!("TCP listener has no local address: {}", e);
            sink.emit(ConnectionEvent::StateChanged(ConnectionState::Failed));
            return;
        }
    };

    sink.emit(ConnectionEvent::LocalDescription(SessionDescription::offer(
        format!("{} offer {} {}", PROTOCOL, token, label),
    )));
    sink.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
    for ip in advertised_ips(&config) {
        sink.emit(ConnectionEvent::LocalCandidate(IceCandidate::new(
            format!("tcp {} {}", ip, port),
            CANDIDATE_MID,
        )));
    }

    let stream = loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                sink.emit(ConnectionEvent::StateChanged(ConnectionState::Failed));
                return;
            }
        };
        match tokio::time::timeout(TOKEN_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(presented)) if presented == token => {
                debug!("Accepted TCP channel from {}", addr);
                break stream;
            }
            _ => warn!("Rejected TCP connection from {}", addr),
        }
    };
    drop(listener);

    run_channel(stream, sink, shared, outbound_rx).await;
}

async fn run_answerer(
    config: TransportConfig,
    sink: ConnectionSink,
    token: String,
    channel: TcpDataChannel,
    mut dial_rx: mpsc::UnboundedReceiver<SocketAddr>,
    shared: Arc<ChannelShared>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    while let Some(addr) = dial_rx.recv().await {
        debug!("Dialing candidate {}", addr);
        let mut stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Candidate {} unreachable: {}", addr, e);
                    continue;
                }
                Err(_) => {
                    debug!("Candidate {} timed out", addr);
                    continue;
                }
            };
        if let Err(e) = write_frame(&mut stream, &token).await {
            debug!("Token write to {} failed: {}", addr, e);
            continue;
        }

        sink.emit(ConnectionEvent::DataChannel(Box::new(channel)));
        run_channel(stream, sink, shared, outbound_rx).await;
        return;
    }
}

/// Pump an established channel until either side closes it
async fn run_channel(
    stream: TcpStream,
    sink: ConnectionSink,
    shared: Arc<ChannelShared>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let peer_addr = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();

    shared.open.store(true, Ordering::SeqCst);
    sink.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    sink.emit(ConnectionEvent::ChannelOpen);
    info!("TCP channel open with {:?}", peer_addr);

    let read_loop = async {
        loop {
            match read_frame(&mut reader).await {
                Ok(text) => sink.emit(ConnectionEvent::ChannelMessage(text)),
                Err(e) => {
                    debug!("TCP channel read ended: {}", e);
                    break;
                }
            }
        }
    };

    // Resolves to true when the local side asked to close
    let write_loop = async {
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(text) => {
                        if let Err(e) = write_frame(&mut writer, &text).await {
                            debug!("TCP channel write failed: {}", e);
                            return false;
                        }
                    }
                    None => return true,
                },
                _ = shared.shutdown.notified() => return true,
            }
        }
    };

    let remote_closed = tokio::select! {
        _ = read_loop => true,
        local = write_loop => !local,
    };

    shared.open.store(false, Ordering::SeqCst);
    let _ = writer.shutdown().await;

    if remote_closed {
        info!("TCP channel with {:?} closed by remote", peer_addr);
        sink.emit(ConnectionEvent::ChannelClosed);
        sink.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    let bytes = text.as_bytes();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Addresses advertised as candidates
fn advertised_ips(config: &TransportConfig) -> Vec<IpAddr> {
    if !config.advertise_ips.is_empty() {
        return config.advertise_ips.clone();
    }
    if !config.bind_ip.is_unspecified() {
        return vec![config.bind_ip];
    }

    let mut ips = Vec::new();
    match local_ip_address::local_ip() {
        Ok(ip) if !ip.is_loopback() => ips.push(ip),
        Ok(_) => {}
        Err(e) => debug!("No LAN address available: {}", e),
    }
    ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ips
}

fn parse_offer(sdp: &str) -> Result<(String, String), NetworkError> {
    let mut parts = sdp.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(PROTOCOL), Some("offer"), Some(token), label) => Ok((
            token.to_string(),
            label.unwrap_or("data").to_string(),
        )),
        _ => Err(NetworkError::InvalidDescription(format!(
            "not a {} offer",
            PROTOCOL
        ))),
    }
}

fn parse_answer(sdp: &str) -> Result<String, NetworkError> {
    let mut parts = sdp.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(PROTOCOL), Some("answer"), Some(token)) => Ok(token.to_string()),
        _ => Err(NetworkError::InvalidDescription(format!(
            "not a {} answer",
            PROTOCOL
        ))),
    }
}

fn parse_candidate(candidate: &str) -> Option<SocketAddr> {
    let mut parts = candidate.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("tcp"), Some(ip), Some(port)) => {
            Some(SocketAddr::new(ip.parse().ok()?, port.parse().ok()?))
        }
        _ => None,
    }
}
