use std::{collections::HashMap, sync::Mutex, time::Duration};

use labrpc::tokio::time::Instant;
use log::{info, trace};

use crate::packet::{Outbound, PaxosPacket};
use crate::types::NodeId;

struct PeerStatus {
    last_heard: Instant,
    up: bool,
}

/// Ping based liveness of the other nodes.
///
/// Every peer starts out up. A peer goes down once nothing was heard from it
/// for `timeout`, and comes back up on the next packet from it.
pub struct FailureDetector {
    node_id: NodeId,
    timeout: Duration,
    peers: Mutex<HashMap<NodeId, PeerStatus>>,
}

impl FailureDetector {
    /// Detector of `node_id` watching every other node in `nodes`.
    pub fn new(node_id: NodeId, nodes: impl IntoIterator<Item = NodeId>, timeout: Duration) -> Self {
        let now = Instant::now();
        let peers = nodes
            .into_iter()
            .filter(|n| *n != node_id)
            .map(|n| {
                (
                    n,
                    PeerStatus {
                        last_heard: now,
                        up: true,
                    },
                )
            })
            .collect();
        Self {
            node_id,
            timeout,
            peers: Mutex::new(peers),
        }
    }

    /// This node is always up; unknown nodes never are.
    pub fn is_up(&self, node: NodeId) -> bool {
        node == self.node_id
            || self
                .peers
                .lock()
                .unwrap()
                .get(&node)
                .is_some_and(|p| p.up)
    }

    /// One detection round: the pings to send, and the peers whose status
    /// changed because they timed out.
    pub fn tick(&self) -> (Vec<Outbound>, Vec<(NodeId, bool)>) {
        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        let mut pings = Vec::with_capacity(peers.len());
        let mut changes = Vec::new();
        for (node, status) in peers.iter_mut() {
            if status.up && now.saturating_duration_since(status.last_heard) > self.timeout {
                info!("node {} timed out, marking down", node);
                status.up = false;
                changes.push((*node, false));
            }
            pings.push(Outbound::one(
                *node,
                PaxosPacket::FailureDetect {
                    sender: self.node_id,
                    responder: *node,
                },
            ));
        }
        (pings, changes)
    }

    /// Record that `node` was heard from. Returns the transition if it was
    /// down.
    pub fn heard_from(&self, node: NodeId) -> Option<(NodeId, bool)> {
        let mut peers = self.peers.lock().unwrap();
        let status = peers.get_mut(&node)?;
        status.last_heard = Instant::now();
        if status.up {
            None
        } else {
            info!("node {} is back up", node);
            status.up = true;
            Some((node, true))
        }
    }

    /// Override the detected status of `node`. Returns whether it changed.
    pub fn set_status(&self, node: NodeId, up: bool) -> bool {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(&node) {
            Some(status) if status.up != up => {
                status.up = up;
                if up {
                    status.last_heard = Instant::now();
                }
                true
            }
            _ => false,
        }
    }

    /// Answer a ping and note the liveness of its sender.
    pub fn handle_packet(&self, packet: &PaxosPacket) -> (Option<Outbound>, Option<(NodeId, bool)>) {
        match *packet {
            PaxosPacket::FailureDetect { sender, responder } if responder == self.node_id => {
                trace!("ping from {}", sender);
                let reply = Outbound::one(
                    sender,
                    PaxosPacket::FailureResponse {
                        sender,
                        responder: self.node_id,
                    },
                );
                (Some(reply), self.heard_from(sender))
            }
            PaxosPacket::FailureResponse { sender, responder } if sender == self.node_id => {
                (None, self.heard_from(responder))
            }
            _ => (None, None),
        }
    }
}
