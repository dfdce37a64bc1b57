//! Same-network signaling
//!
//! The host runs a [`LocalSignalingServer`] and registers with it as
//! `"HOST"`; joiners decode the server address from the LAN code. The
//! server speaks the same protocol as a cloud broker, so it also serves as a
//! standalone broker (see the `signaling-server` binary).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::client::SignalingClient;
use super::cloud::random_peer_id;
use super::{ErrorPayload, SignalingMessage, SignalingSink, SignalingTransport};
use crate::config::LocalConfig;
use crate::network::connection::IceCandidate;
use crate::network::error::NetworkError;
use crate::network::tcp::bind_listener;

/// Signaling id the host registers under on its own server
pub const LOCAL_HOST_ID: &str = "HOST";

/// How long a client without `?id=` has to send its `{"id":...}` frame
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

type ClientMap = HashMap<String, mpsc::UnboundedSender<String>>;

/// Registry of connected signaling clients, routing messages by `dst`
#[derive(Clone, Default)]
pub struct SignalingHub {
    clients: Arc<RwLock<ClientMap>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Serve one websocket client until it disconnects
    pub async fn serve<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut query_id: Option<String> = None;
        let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
            query_id = id_from_query(req.uri().query());
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .map_err(|e| NetworkError::Signaling(format!("WebSocket accept failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        let id = match query_id {
            Some(id) => id,
            None => match tokio::time::timeout(REGISTER_TIMEOUT, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => id_from_frame(&text).ok_or_else(|| {
                    NetworkError::Signaling(format!("{} sent no id", peer_addr))
                })?,
                _ => {
                    return Err(NetworkError::Signaling(format!(
                        "{} did not register",
                        peer_addr
                    )))
                }
            },
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let taken = {
            let mut clients = self.clients.write().await;
            if clients.contains_key(&id) {
                true
            } else {
                clients.insert(id.clone(), tx);
                false
            }
        };

        if taken {
            warn!("Signaling id {} already registered, rejecting {}", id, peer_addr);
            let reply = SignalingMessage::IdTaken {
                payload: ErrorPayload {
                    msg: "ID is taken".to_string(),
                },
            };
            let _ = write.send(Message::Text(reply.to_json()?)).await;
            let _ = write.close().await;
            return Ok(());
        }

        info!("Signaling client {} registered from {}", id, peer_addr);
        let open = SignalingMessage::Open {
            id: Some(id.clone()),
        };

        let result = async {
            write
                .send(Message::Text(open.to_json()?))
                .await
                .map_err(|e| NetworkError::Signaling(format!("Send failed: {}", e)))?;

            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reply) = self.route(&id, &text).await {
                                    if write.send(Message::Text(reply)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!("WebSocket error from {}: {}", id, e);
                                break;
                            }
                            _ => {}
                        }
                    }

                    forwarded = rx.recv() => {
                        match forwarded {
                            Some(text) => {
                                if write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), NetworkError>(())
        }
        .await;

        self.clients.write().await.remove(&id);
        info!("Signaling client {} disconnected", id);
        result
    }

    /// Route one frame from `src`. Returns a reply for the sender, if any.
    async fn route(&self, src: &str, text: &str) -> Option<String> {
        let mut value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid message from {}: {}", src, e);
                return None;
            }
        };

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // Clients answer heartbeats, so replying would loop
        if kind == "HEARTBEAT" {
            trace!("Heartbeat from {}", src);
            return None;
        }
        let undeliverable_reply = !matches!(kind.as_str(), "LEAVE" | "EXPIRE");

        let dst = value.get("dst").and_then(Value::as_str)?.to_string();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("src".to_string(), Value::String(src.to_string()));
        }

        let target = self.clients.read().await.get(&dst).cloned();
        match target {
            Some(target) if target.send(value.to_string()).is_ok() => {
                trace!("Forwarded {} from {} to {}", kind, src, dst);
                None
            }
            _ if undeliverable_reply => {
                debug!("Destination {} unknown, expiring {} from {}", dst, kind, src);
                SignalingMessage::Expire {
                    src: Some(dst),
                    dst: Some(src.to_string()),
                }
                .to_json()
                .ok()
            }
            _ => None,
        }
    }
}

fn id_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "id" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn id_from_frame(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// IPv4 address embedded in a host's LAN code
pub fn advertised_lan_ip(config: &LocalConfig) -> Ipv4Addr {
    if let Some(ip) = config.advertise_ip {
        return ip;
    }
    if let IpAddr::V4(ip) = config.bind_ip {
        if !ip.is_unspecified() {
            return ip;
        }
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => ip,
        Ok(ip) => {
            debug!("Primary address {} is not IPv4, advertising loopback", ip);
            Ipv4Addr::LOCALHOST
        }
        Err(e) => {
            debug!("No LAN address available: {}", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Discovery server run by a LAN host
pub struct LocalSignalingServer {
    local_addr: SocketAddr,
    hub: SignalingHub,
    task: JoinHandle<()>,
}

impl LocalSignalingServer {
    /// Bind and start accepting. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let hub = SignalingHub::new();
        let task = tokio::spawn(accept_loop(listener, hub.clone()));

        info!("Local signaling server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            hub,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn hub(&self) -> &SignalingHub {
        &self.hub
    }

    /// Stop accepting and drop every client connection
    pub fn stop(&self) {
        if !self.task.is_finished() {
            info!("Local signaling server on {} stopped", self.local_addr);
        }
        self.task.abort();
    }
}

impl Drop for LocalSignalingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, hub: SignalingHub) {
    // Dropping the set aborts every client task
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New signaling connection from {}", peer_addr);
                        let hub = hub.clone();
                        connections.spawn(async move {
                            if let Err(e) = hub.serve(stream, peer_addr).await {
                                warn!("Signaling connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Client side of LAN signaling
pub struct LocalSignaling {
    server: SocketAddr,
    sink: SignalingSink,
    client: Option<SignalingClient>,
}

impl LocalSignaling {
    pub fn new(server: SocketAddr, sink: SignalingSink) -> Self {
        Self {
            server,
            sink,
            client: None,
        }
    }

    fn endpoint(&self, id: &str) -> String {
        format!("ws://{}/peerjs?id={}", self.server, id)
    }

    fn client(&self) -> Result<&SignalingClient, NetworkError> {
        self.client
            .as_ref()
            .ok_or_else(|| NetworkError::Signaling("Not connected".to_string()))
    }
}

impl SignalingTransport for LocalSignaling {
    fn connect(&mut self, preferred_id: Option<String>) -> Result<(), NetworkError> {
        self.disconnect();

        let id = preferred_id.unwrap_or_else(random_peer_id);
        info!("Connecting to local signaling server {} as {}", self.server, id);
        self.client = Some(SignalingClient::start(
            self.endpoint(&id),
            id,
            self.sink.clone(),
            None,
        ));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.stop();
        }
    }

    fn send_offer(&self, target: &str, sdp: &str, correlation_id: &str) -> Result<(), NetworkError> {
        self.client()?.send_offer(target, sdp, correlation_id)
    }

    fn send_answer(
        &self,
        target: &str,
        sdp: &str,
        correlation_id: &str,
    ) -> Result<(), NetworkError> {
        self.client()?.send_answer(target, sdp, correlation_id)
    }

    fn send_candidate(
        &self,
        target: &str,
        candidate: &IceCandidate,
        correlation_id: &str,
    ) -> Result<(), NetworkError> {
        self.client()?.send_candidate(target, candidate, correlation_id)
    }

    fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_open())
    }

    fn local_id(&self) -> Option<String> {
        self.client.as_ref().map(|c| c.local_id())
    }
}
