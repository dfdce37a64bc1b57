//! Websocket client shared by both signaling transports

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use super::{
    CandidatePayload, DescriptionPayload, SignalingEvent, SignalingMessage, SignalingSink,
};
use crate::network::connection::IceCandidate;
use crate::network::error::NetworkError;

/// Time allowed for the websocket handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct ClientShared {
    /// Set once the broker acknowledged our registration
    open: AtomicBool,
    local_id: RwLock<String>,
}

/// A running signaling socket. Dropping it closes the socket silently.
pub(crate) struct SignalingClient {
    shared: Arc<ClientShared>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Open `url`, registering as `id`. The broker may assign another id
    /// in its OPEN reply.
    pub(crate) fn start(
        url: String,
        id: String,
        sink: SignalingSink,
        heartbeat: Option<Duration>,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            open: AtomicBool::new(false),
            local_id: RwLock::new(id),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_client(
            url,
            sink,
            shared.clone(),
            outbound_rx,
            heartbeat,
        ));

        Self {
            shared,
            outbound,
            task,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub(crate) fn local_id(&self) -> String {
        self.shared.local_id.read().clone()
    }

    /// Queue a message for the broker; dropped unless registered
    pub(crate) fn send(&self, msg: SignalingMessage) -> Result<(), NetworkError> {
        if !self.is_open() {
            debug!("Dropping signaling message before OPEN: {:?}", msg);
            return Err(NetworkError::Signaling("Not connected".to_string()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| NetworkError::Signaling("Connection closed".to_string()))
    }

    pub(crate) fn send_offer(
        &self,
        target: &str,
        sdp: &str,
        correlation_id: &str,
    ) -> Result<(), NetworkError> {
        self.send(SignalingMessage::Offer {
            src: None,
            dst: Some(target.to_string()),
            payload: DescriptionPayload::offer(sdp, correlation_id),
        })
    }

    pub(crate) fn send_answer(
        &self,
        target: &str,
        sdp: &str,
        correlation_id: &str,
    ) -> Result<(), NetworkError> {
        self.send(SignalingMessage::Answer {
            src: None,
            dst: Some(target.to_string()),
            payload: DescriptionPayload::answer(sdp, correlation_id),
        })
    }

    pub(crate) fn send_candidate(
        &self,
        target: &str,
        candidate: &IceCandidate,
        correlation_id: &str,
    ) -> Result<(), NetworkError> {
        self.send(SignalingMessage::Candidate {
            src: None,
            dst: Some(target.to_string()),
            payload: CandidatePayload::new(candidate, correlation_id),
        })
    }

    pub(crate) fn stop(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_client(
    url: String,
    sink: SignalingSink,
    shared: Arc<ClientShared>,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    heartbeat: Option<Duration>,
) {
    let ws_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await
    {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            warn!("Signaling connect to {} failed: {}", url, e);
            sink.emit(SignalingEvent::Error(format!("Connect failed: {}", e)));
            return;
        }
        Err(_) => {
            warn!("Signaling connect to {} timed out", url);
            sink.emit(SignalingEvent::Error("Connect timed out".to_string()));
            return;
        }
    };
    debug!("Signaling socket open to {}, waiting for OPEN", url);

    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat =
        heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(SignalingMessage::Heartbeat) => {
                                trace!("Heartbeat from broker");
                                if let Ok(json) = SignalingMessage::Heartbeat.to_json() {
                                    if write.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(msg) => handle_inbound(msg, &shared, &sink),
                            Err(e) => warn!("Invalid signaling message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Signaling socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            out = outbound_rx.recv() => {
                let Some(msg) = out else {
                    let _ = write.close().await;
                    return;
                };
                match msg.to_json() {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!("Signaling send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling message: {}", e),
                }
            }

            _ = next_tick(&mut heartbeat) => {
                if shared.open.load(Ordering::SeqCst) {
                    if let Ok(json) = SignalingMessage::Heartbeat.to_json() {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    shared.open.store(false, Ordering::SeqCst);
    info!("Signaling connection to {} closed", url);
    sink.emit(SignalingEvent::Closed);
}

fn handle_inbound(msg: SignalingMessage, shared: &ClientShared, sink: &SignalingSink) {
    match msg {
        SignalingMessage::Open { id } => {
            if let Some(id) = id {
                *shared.local_id.write() = id;
            }
            shared.open.store(true, Ordering::SeqCst);
            let id = shared.local_id.read().clone();
            info!("Signaling connected as {}", id);
            sink.emit(SignalingEvent::Connected(id));
        }
        SignalingMessage::Offer {
            src: Some(from),
            payload,
            ..
        } => sink.emit(SignalingEvent::OfferReceived {
            from,
            sdp: payload.sdp.sdp,
            correlation_id: payload.connection_id,
        }),
        SignalingMessage::Answer {
            src: Some(from),
            payload,
            ..
        } => sink.emit(SignalingEvent::AnswerReceived {
            from,
            sdp: payload.sdp.sdp,
            correlation_id: payload.connection_id,
        }),
        SignalingMessage::Candidate {
            src: Some(from),
            payload,
            ..
        } => sink.emit(SignalingEvent::CandidateReceived {
            from,
            candidate: payload.to_candidate(),
            correlation_id: payload.connection_id,
        }),
        SignalingMessage::Error { payload } => {
            shared.open.store(false, Ordering::SeqCst);
            sink.emit(SignalingEvent::Error(payload.msg));
        }
        SignalingMessage::IdTaken { payload } => {
            shared.open.store(false, Ordering::SeqCst);
            let msg = if payload.msg.is_empty() {
                "ID is taken".to_string()
            } else {
                payload.msg
            };
            sink.emit(SignalingEvent::Error(msg));
        }
        SignalingMessage::Expire { src: Some(peer_id), .. }
        | SignalingMessage::Leave { src: Some(peer_id), .. } => {
            sink.emit(SignalingEvent::PeerUnavailable { peer_id })
        }
        other => debug!("Ignoring signaling message: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_test::assert_ok;
    use tokio_tungstenite::accept_async;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for signaling event")
            .expect("Signaling sink closed")
    }

    /// Test: Registration gate and heartbeat reply
    /// Given a broker that accepts the socket but holds back OPEN
    /// When the client sends an offer, then receives OPEN and a HEARTBEAT
    /// Then the offer is refused and never reaches the broker, the client
    /// reports the assigned id, and the heartbeat is answered in kind
    #[tokio::test]
    async fn test_send_gated_on_open_and_heartbeat_reply() {
        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        let (socket_open_tx, socket_open_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            let _ = socket_open_tx.send(());
            let _ = release_rx.await;

            let open = r#"{"type":"OPEN","id":"ABC234"}"#.to_string();
            ws.send(Message::Text(open)).await.expect("send OPEN");
            let heartbeat = r#"{"type":"HEARTBEAT"}"#.to_string();
            ws.send(Message::Text(heartbeat)).await.expect("send HEARTBEAT");

            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended: {:?}", other),
                }
            }
        });

        let (sink, mut rx) = SignalingSink::channel();
        let client = SignalingClient::start(
            format!("ws://{}/peerjs", addr),
            "PREFER".to_string(),
            sink,
            None,
        );

        assert_ok!(socket_open_rx.await);
        assert!(!client.is_open());
        assert!(client.send_offer("HOST", "sdp", "dc_1").is_err());

        assert_ok!(release_tx.send(()));
        assert_eq!(next_event(&mut rx).await, SignalingEvent::Connected("ABC234".to_string()));
        assert!(client.is_open());
        assert_eq!(client.local_id(), "ABC234");

        let first_frame = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .expect("broker timed out")
            .expect("broker task failed");
        let reply: SignalingMessage = assert_ok!(serde_json::from_str(&first_frame));
        assert_eq!(reply, SignalingMessage::Heartbeat);
    }
}
