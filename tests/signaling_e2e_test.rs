//! E2E tests for the signaling transports
//!
//! Runs the cloud and LAN transports against a broker on loopback and
//! checks what the other side receives.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

use peerlink::config::CloudConfig;
use peerlink::network::{
    CloudSignaling, IceCandidate, LocalSignaling, LocalSignalingServer, SignalingEvent,
    SignalingSink, SignalingTransport,
};

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

fn start_broker() -> LocalSignalingServer {
    assert_ok!(LocalSignalingServer::bind(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        find_available_port(),
    )))
}

async fn next_event(rx: &mut UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for signaling event")
        .expect("Signaling sink closed")
}

fn cloud_config(broker: &LocalSignalingServer) -> CloudConfig {
    CloudConfig {
        url: format!("ws://{}/peerjs", broker.local_addr()),
        ..Default::default()
    }
}

/// Test: Register under a preferred id
/// Given a running broker
/// When a cloud transport connects asking for an id
/// Then the broker confirms that id
#[tokio::test]
async fn test_cloud_register_preferred_id() {
    let broker = start_broker();
    let (sink, mut rx) = SignalingSink::channel();
    let mut signaling = CloudSignaling::new(&cloud_config(&broker), sink);

    assert!(!signaling.is_connected());
    assert_ok!(signaling.connect(Some("ABC234".to_string())));

    assert_eq!(next_event(&mut rx).await, SignalingEvent::Connected("ABC234".to_string()));
    assert!(signaling.is_connected());
    assert_eq!(signaling.local_id().as_deref(), Some("ABC234"));

    signaling.disconnect();
    assert!(!signaling.is_connected());
}

/// Test: Offer, answer and candidate exchange
/// Given two transports registered on one broker
/// When one sends an offer and a candidate and the other answers
/// Then each side receives the other's messages with sender and correlation id
#[tokio::test]
async fn test_offer_answer_candidate_exchange() {
    let broker = start_broker();

    let (host_sink, mut host_rx) = SignalingSink::channel();
    let mut host = CloudSignaling::new(&cloud_config(&broker), host_sink);
    assert_ok!(host.connect(Some("HOSTX2".to_string())));
    next_event(&mut host_rx).await;

    let (guest_sink, mut guest_rx) = SignalingSink::channel();
    let mut guest = LocalSignaling::new(broker.local_addr(), guest_sink);
    assert_ok!(guest.connect(None));
    let SignalingEvent::Connected(guest_id) = next_event(&mut guest_rx).await else {
        panic!("Expected registration");
    };
    assert_eq!(guest_id.len(), 16);

    assert_ok!(guest.send_offer("HOSTX2", "offer-sdp", "dc_1"));
    let candidate = IceCandidate::new("tcp 127.0.0.1 4000", "0");
    assert_ok!(guest.send_candidate("HOSTX2", &candidate, "dc_1"));

    assert_eq!(
        next_event(&mut host_rx).await,
        SignalingEvent::OfferReceived {
            from: guest_id.clone(),
            sdp: "offer-sdp".to_string(),
            correlation_id: Some("dc_1".to_string()),
        }
    );
    assert_eq!(
        next_event(&mut host_rx).await,
        SignalingEvent::CandidateReceived {
            from: guest_id.clone(),
            candidate,
            correlation_id: Some("dc_1".to_string()),
        }
    );

    assert_ok!(host.send_answer(&guest_id, "answer-sdp", "dc_1"));
    assert_eq!(
        next_event(&mut guest_rx).await,
        SignalingEvent::AnswerReceived {
            from: "HOSTX2".to_string(),
            sdp: "answer-sdp".to_string(),
            correlation_id: Some("dc_1".to_string()),
        }
    );
}

/// Test: Sending before registration
/// Given a transport that never connected
/// When it sends an offer
/// Then the send is refused
#[tokio::test]
async fn test_send_before_connect_fails() {
    let broker = start_broker();
    let (sink, _rx) = SignalingSink::channel();
    let signaling = CloudSignaling::new(&cloud_config(&broker), sink);

    assert!(signaling.send_offer("ABC234", "sdp", "dc_1").is_err());
    assert!(signaling.local_id().is_none());
}

/// Test: Broker goes away
/// Given a registered transport
/// When the broker stops
/// Then the transport reports the socket closed
#[tokio::test]
async fn test_broker_stop_reports_closed() {
    let broker = start_broker();
    let (sink, mut rx) = SignalingSink::channel();
    let mut signaling = CloudSignaling::new(&cloud_config(&broker), sink);
    assert_ok!(signaling.connect(Some("QWERTY".to_string())));
    next_event(&mut rx).await;

    broker.stop();

    assert_eq!(next_event(&mut rx).await, SignalingEvent::Closed);
    assert!(!signaling.is_connected());
}
