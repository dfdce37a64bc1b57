//! Star / Mesh policy
//!
//! Decides which peers a node connects to, who relays, and what the host
//! tells its peers when membership changes. Holds no connection state.

use serde::{Deserialize, Serialize};

use super::code::NetworkCode;
use super::envelope::SystemNotice;
use super::signaling::LOCAL_HOST_ID;

/// Room topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Joiners connect to the host only
    #[default]
    Star,
    /// Every pair of nodes connects directly
    Mesh,
}

/// A notice and the peer it goes to
pub type Addressed = (String, SystemNotice);

/// What a joiner does with a notice from its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeAction {
    /// Open direct channels to these nodes
    Connect(Vec<String>),
    /// A member reachable through the host appeared
    MemberJoined(String),
    MemberLeft(String),
    Ignore,
}

#[derive(Debug, Clone, Copy)]
pub struct TopologyController {
    topology: Topology,
    auto_relay: bool,
}

impl TopologyController {
    pub fn new(topology: Topology, auto_relay: bool) -> Self {
        Self {
            topology,
            auto_relay,
        }
    }

    pub fn set_auto_relay(&mut self, auto_relay: bool) {
        self.auto_relay = auto_relay;
    }

    /// Signaling id of the host of a room
    pub fn host_peer_id(code: &NetworkCode) -> String {
        match code {
            NetworkCode::Cloud(code) => code.clone(),
            NetworkCode::Lan(_) => LOCAL_HOST_ID.to_string(),
        }
    }

    /// Glare tie-break: when two nodes offer to each other at once, the
    /// lexicographically smaller id keeps its offer and ignores the other.
    pub fn keeps_own_offer(local_id: &str, remote_id: &str) -> bool {
        local_id < remote_id
    }

    /// Whether inbound application messages are re-broadcast
    pub fn should_relay(&self, is_host: bool) -> bool {
        self.topology == Topology::Star && self.auto_relay && is_host
    }

    /// Peers that receive a relayed message from `origin`
    pub fn relay_targets<'a>(&self, origin: &str, ready: &'a [String]) -> Vec<&'a str> {
        ready
            .iter()
            .map(String::as_str)
            .filter(|peer| *peer != origin)
            .collect()
    }

    /// Whether a node accepts an inbound offer. Star joiners only ever
    /// talk to the host, which never offers.
    pub fn accepts_offers(&self, is_host: bool) -> bool {
        is_host || self.topology == Topology::Mesh
    }

    /// Notices the host sends once `newcomer` is ready. `existing` are the
    /// other ready peers, in join order.
    pub fn join_notices(&self, newcomer: &str, existing: &[String]) -> Vec<Addressed> {
        let mut notices = Vec::new();
        match self.topology {
            Topology::Mesh => {
                if !existing.is_empty() {
                    notices.push((
                        newcomer.to_string(),
                        SystemNotice::MeshPeers {
                            nodes: existing.to_vec(),
                        },
                    ));
                }
            }
            Topology::Star => {
                for member in existing {
                    notices.push((
                        newcomer.to_string(),
                        SystemNotice::NodeJoined {
                            node_id: member.clone(),
                        },
                    ));
                }
            }
        }
        for member in existing {
            notices.push((
                member.clone(),
                SystemNotice::NodeJoined {
                    node_id: newcomer.to_string(),
                },
            ));
        }
        notices
    }

    /// Notices the host sends once `departed` is gone. Mesh peers notice
    /// departures on their own channels.
    pub fn leave_notices(&self, departed: &str, remaining: &[String]) -> Vec<Addressed> {
        if self.topology == Topology::Mesh {
            return Vec::new();
        }
        remaining
            .iter()
            .map(|member| {
                (
                    member.clone(),
                    SystemNotice::NodeLeft {
                        node_id: departed.to_string(),
                    },
                )
            })
            .collect()
    }

    /// Interpret a notice received by a joiner from its host
    pub fn on_notice(&self, notice: SystemNotice, local_id: &str) -> NoticeAction {
        match (self.topology, notice) {
            (Topology::Mesh, SystemNotice::MeshPeers { nodes }) => NoticeAction::Connect(
                nodes.into_iter().filter(|node| node != local_id).collect(),
            ),
            (Topology::Mesh, SystemNotice::NodeJoined { node_id }) if node_id != local_id => {
                NoticeAction::Connect(vec![node_id])
            }
            (Topology::Star, SystemNotice::NodeJoined { node_id }) if node_id != local_id => {
                NoticeAction::MemberJoined(node_id)
            }
            (Topology::Star, SystemNotice::NodeLeft { node_id }) => {
                NoticeAction::MemberLeft(node_id)
            }
            _ => NoticeAction::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_host_peer_id() {
        assert_eq!(
            TopologyController::host_peer_id(&NetworkCode::Cloud("ABC234".to_string())),
            "ABC234"
        );
        assert_eq!(
            TopologyController::host_peer_id(&NetworkCode::Lan(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                9000
            ))),
            "HOST"
        );
    }

    /// Given two nodes that offered to each other at the same time
    /// When each side applies the tie-break
    /// Then exactly one keeps its own offer
    #[test]
    fn test_glare_tie_break() {
        let (a, b) = ("1f31388d2e4e42cb", "c698f6dc3db34daa");
        assert!(TopologyController::keeps_own_offer(a, b));
        assert!(!TopologyController::keeps_own_offer(b, a));
        assert_ne!(
            TopologyController::keeps_own_offer(a, b),
            TopologyController::keeps_own_offer(b, a)
        );
    }

    #[test]
    fn test_relay_policy() {
        let star = TopologyController::new(Topology::Star, true);
        assert!(star.should_relay(true));
        assert!(!star.should_relay(false));
        assert!(!TopologyController::new(Topology::Star, false).should_relay(true));
        assert!(!TopologyController::new(Topology::Mesh, true).should_relay(true));

        let ready = ids(&["b", "c", "d"]);
        assert_eq!(star.relay_targets("c", &ready), vec!["b", "d"]);
    }

    #[test]
    fn test_mesh_join_notices() {
        let mesh = TopologyController::new(Topology::Mesh, true);
        let notices = mesh.join_notices("c", &ids(&["a", "b"]));
        assert_eq!(
            notices[0],
            (
                "c".to_string(),
                SystemNotice::MeshPeers {
                    nodes: ids(&["a", "b"])
                }
            )
        );
        assert_eq!(notices.len(), 3);

        // First joiner gets no peer list
        assert!(mesh.join_notices("a", &[]).is_empty());
        assert!(mesh.leave_notices("a", &ids(&["b"])).is_empty());
    }

    #[test]
    fn test_star_join_and_leave_notices() {
        let star = TopologyController::new(Topology::Star, true);
        let notices = star.join_notices("c", &ids(&["a"]));
        assert_eq!(
            notices,
            vec![
                (
                    "c".to_string(),
                    SystemNotice::NodeJoined {
                        node_id: "a".to_string()
                    }
                ),
                (
                    "a".to_string(),
                    SystemNotice::NodeJoined {
                        node_id: "c".to_string()
                    }
                ),
            ]
        );

        let left = star.leave_notices("c", &ids(&["a"]));
        assert_eq!(
            left,
            vec![(
                "a".to_string(),
                SystemNotice::NodeLeft {
                    node_id: "c".to_string()
                }
            )]
        );
    }

    #[test]
    fn test_on_notice() {
        let mesh = TopologyController::new(Topology::Mesh, true);
        assert_eq!(
            mesh.on_notice(
                SystemNotice::MeshPeers {
                    nodes: ids(&["a", "me", "b"])
                },
                "me"
            ),
            NoticeAction::Connect(ids(&["a", "b"]))
        );
        assert_eq!(
            mesh.on_notice(
                SystemNotice::NodeLeft {
                    node_id: "a".to_string()
                },
                "me"
            ),
            NoticeAction::Ignore
        );

        let star = TopologyController::new(Topology::Star, true);
        assert_eq!(
            star.on_notice(
                SystemNotice::NodeJoined {
                    node_id: "a".to_string()
                },
                "me"
            ),
            NoticeAction::MemberJoined("a".to_string())
        );
        assert_eq!(
            star.on_notice(
                SystemNotice::MeshPeers {
                    nodes: ids(&["a"])
                },
                "me"
            ),
            NoticeAction::Ignore
        );
        assert!(!star.accepts_offers(false));
        assert!(mesh.accepts_offers(false));
    }
}
