use labrpc::anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Ballot, Checkpoint, NodeId, PValue, RequestPacket, Slot};

/// Name of the discriminator field of every packet.
pub const PACKET_TYPE: &str = "type";

/// Wire messages exchanged by paxos replicas, encoded as JSON objects with a
/// `"type"` discriminator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaxosPacket {
    /// A client request, submitted locally or forwarded to the coordinator.
    Request {
        /// Target group.
        paxos_id: String,
        /// The request to decide.
        request: RequestPacket,
    },
    /// Phase 1 of an election.
    Prepare {
        /// Target group.
        paxos_id: String,
        /// The candidate.
        sender: NodeId,
        /// Ballot the candidate asks members to promise.
        ballot: Ballot,
    },
    /// Promise when `ballot` equals the prepared ballot, rejection when it is
    /// higher.
    PrepareReply {
        /// Target group.
        paxos_id: String,
        /// The member answering.
        sender: NodeId,
        /// Ballot promised by the member.
        ballot: Ballot,
        /// Pvalues the member accepted and has not executed.
        accepted: Vec<PValue>,
        /// First slot the member has not executed.
        executed: Slot,
    },
    /// Phase 2: a value proposed for a slot.
    Accept {
        /// Target group.
        paxos_id: String,
        /// The coordinator.
        sender: NodeId,
        /// The proposal.
        pvalue: PValue,
    },
    /// Acknowledgement when `ballot` equals the accept's ballot, rejection
    /// when it is higher.
    AcceptReply {
        /// Target group.
        paxos_id: String,
        /// The member answering.
        sender: NodeId,
        /// Ballot promised by the member.
        ballot: Ballot,
        /// Slot of the accept.
        slot: Slot,
    },
    /// A request chosen for a slot.
    Decision {
        /// Target group.
        paxos_id: String,
        /// The node that learned the decision.
        sender: NodeId,
        /// Decided slot.
        slot: Slot,
        /// Decided request.
        request: RequestPacket,
    },
    /// Ask a peer for the decisions a member missed.
    SyncRequest {
        /// Target group.
        paxos_id: String,
        /// The member that is behind.
        sender: NodeId,
        /// First slot the member has not executed.
        from: Slot,
    },
    /// Answer to a [`PaxosPacket::SyncRequest`].
    SyncReply {
        /// Target group.
        paxos_id: String,
        /// The member answering.
        sender: NodeId,
        /// A checkpoint to jump to, when the missed decisions were collected.
        checkpoint: Option<Checkpoint>,
        /// Logged decisions after `from` or after the checkpoint.
        decisions: Vec<(Slot, RequestPacket)>,
    },
    /// Liveness ping.
    FailureDetect {
        /// The pinging node.
        sender: NodeId,
        /// The pinged node.
        responder: NodeId,
    },
    /// Answer to a ping.
    FailureResponse {
        /// The pinging node.
        sender: NodeId,
        /// The node answering.
        responder: NodeId,
    },
}

/// The discriminator alone, read before the rest of a packet is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum PacketType {
    Request,
    Prepare,
    PrepareReply,
    Accept,
    AcceptReply,
    Decision,
    SyncRequest,
    SyncReply,
    FailureDetect,
    FailureResponse,
}

impl PacketType {
    /// Read the discriminator of a JSON packet.
    pub fn of(json: &Value) -> Result<Self> {
        let t = json
            .get(PACKET_TYPE)
            .ok_or_else(|| anyhow!("packet has no {} field", PACKET_TYPE))?;
        Ok(serde_json::from_value(t.clone())?)
    }
}

impl PaxosPacket {
    /// Group the packet is addressed to; `None` for failure detection.
    pub fn paxos_id(&self) -> Option<&str> {
        use PaxosPacket::*;
        match self {
            Request { paxos_id, .. }
            | Prepare { paxos_id, .. }
            | PrepareReply { paxos_id, .. }
            | Accept { paxos_id, .. }
            | AcceptReply { paxos_id, .. }
            | Decision { paxos_id, .. }
            | SyncRequest { paxos_id, .. }
            | SyncReply { paxos_id, .. } => Some(paxos_id),
            FailureDetect { .. } | FailureResponse { .. } => None,
        }
    }

    /// Discriminator of this packet.
    pub fn packet_type(&self) -> PacketType {
        use PaxosPacket::*;
        match self {
            Request { .. } => PacketType::Request,
            Prepare { .. } => PacketType::Prepare,
            PrepareReply { .. } => PacketType::PrepareReply,
            Accept { .. } => PacketType::Accept,
            AcceptReply { .. } => PacketType::AcceptReply,
            Decision { .. } => PacketType::Decision,
            SyncRequest { .. } => PacketType::SyncRequest,
            SyncReply { .. } => PacketType::SyncReply,
            FailureDetect { .. } => PacketType::FailureDetect,
            FailureResponse { .. } => PacketType::FailureResponse,
        }
    }

    /// Encode as a JSON object.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a JSON object.
    pub fn from_json(json: Value) -> Result<Self> {
        Ok(serde_json::from_value(json)?)
    }
}

/// A packet a replica wants delivered to some of its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Recipients.
    pub to: Vec<NodeId>,
    /// What to send.
    pub packet: PaxosPacket,
}

impl Outbound {
    /// Send `packet` to every node in `to`.
    pub fn new(to: Vec<NodeId>, packet: PaxosPacket) -> Self {
        Self { to, packet }
    }

    /// Send `packet` to `to` only.
    pub fn one(to: NodeId, packet: PaxosPacket) -> Self {
        Self { to: vec![to], packet }
    }
}
