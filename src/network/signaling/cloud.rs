//! Signaling through a PeerJS-compatible cloud broker

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use super::client::SignalingClient;
use super::{SignalingSink, SignalingTransport};
use crate::config::CloudConfig;
use crate::network::connection::IceCandidate;
use crate::network::error::NetworkError;

/// Length of a broker id picked by a joiner
const RANDOM_ID_LEN: usize = 16;

const TOKEN_LEN: usize = 8;

fn random_hex(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

/// Random peer id for joiners
pub(crate) fn random_peer_id() -> String {
    random_hex(RANDOM_ID_LEN)
}

pub struct CloudSignaling {
    url: String,
    key: String,
    heartbeat: Option<Duration>,
    sink: SignalingSink,
    client: Option<SignalingClient>,
}

impl CloudSignaling {
    pub fn new(config: &CloudConfig, sink: SignalingSink) -> Self {
        Self {
            url: config.url.clone(),
            key: config.key.clone(),
            heartbeat: config.heartbeat_interval(),
            sink,
            client: None,
        }
    }

    /// Broker URL for one registration
    fn endpoint(&self, id: &str, token: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}key={}&id={}&token={}",
            self.url, separator, self.key, id, token
        )
    }

    fn client(&self) -> Result<&SignalingClient, NetworkError> {
        self.client
            .as_ref()
            .ok_or_else(|| NetworkError::Signaling("Not connected".to_string()))
    }
}

impl SignalingTransport for CloudSignaling {
    fn connect(&mut self, preferred_id: Option<String>) -> Result<(), NetworkError> {
        self.disconnect();

        let id = preferred_id.unwrap_or_else(random_peer_id);
        let url = self.endpoint(&id, &random_hex(TOKEN_LEN));
        info!("Connecting to signaling broker {} as {}", self.url, id);

        self.client = Some(SignalingClient::start(
            url,
            id,
            self.sink.clone(),
            self.heartbeat,
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
