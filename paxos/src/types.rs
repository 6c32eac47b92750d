use std::fmt;

use serde::{Deserialize, Serialize};

pub use labrpc::NodeId;

/// Position in a group's decided sequence.
pub type Slot = u64;

/// Suffix that marks the id of a group among primaries.
pub const PRIMARY_SUFFIX: &str = "-P";

/// Ballot with round number and the coordinator that issued it.
///
/// Ordered by round first, then by coordinator id, so two nodes never issue
/// equal ballots.
#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    /// Round number.
    pub number: u64,
    /// Node that issued the ballot.
    pub coordinator: NodeId,
}

impl Ballot {
    /// Ballot `number:coordinator`.
    pub fn new(number: u64, coordinator: NodeId) -> Self {
        Self {
            number,
            coordinator,
        }
    }

    /// The smallest ballot owned by `coordinator` that is above `self`.
    pub fn successor(self, coordinator: NodeId) -> Self {
        Self::new(self.number + 1, coordinator)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number, self.coordinator)
    }
}

/// The two flavors of paxos group. They run the same protocol and differ only
/// in how the registry key is derived from the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupRole {
    /// Fixed id of the form `name-P`, run among replica controllers.
    Primary,
    /// Id of the form `name-<epoch>`, run among the active replicas of a name.
    Active,
}

impl GroupRole {
    /// Role of the group `paxos_id`.
    pub fn of(paxos_id: &str) -> Self {
        if paxos_id.ends_with(PRIMARY_SUFFIX) {
            GroupRole::Primary
        } else {
            GroupRole::Active
        }
    }
}

/// Registry key of a paxos id.
///
/// Primary ids are their own key. Active ids lose their epoch suffix, so
/// `"name-7"` and `"name-8"` map to the same key `"name"`.
pub fn paxos_key(paxos_id: &str) -> &str {
    match GroupRole::of(paxos_id) {
        GroupRole::Primary => paxos_id,
        GroupRole::Active => match paxos_id.rfind('-') {
            Some(i) => &paxos_id[..i],
            None => paxos_id,
        },
    }
}

/// A client request proposed to a group.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Issuing client.
    pub client_id: u64,
    /// Sequence number of the request at its client.
    pub request_id: u64,
    /// Payload handed to the application.
    pub value: String,
    /// Deciding a stop request tombstones the group.
    #[serde(default)]
    pub stop: bool,
    /// Filler decided in slots left empty by a failed coordinator; never
    /// handed to the application.
    #[serde(default)]
    pub noop: bool,
}

impl RequestPacket {
    /// An ordinary request carrying `value`.
    pub fn new(client_id: u64, request_id: u64, value: impl Into<String>) -> Self {
        Self {
            client_id,
            request_id,
            value: value.into(),
            ..Default::default()
        }
    }

    /// A request that tombstones the group once decided.
    pub fn stop_request(client_id: u64, request_id: u64) -> Self {
        Self {
            client_id,
            request_id,
            stop: true,
            ..Default::default()
        }
    }

    /// A filler for an empty slot.
    pub fn noop() -> Self {
        Self {
            noop: true,
            ..Default::default()
        }
    }
}

/// A request bound to a slot under a ballot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PValue {
    /// Ballot the request was proposed under.
    pub ballot: Ballot,
    /// Slot the request was proposed for.
    pub slot: Slot,
    /// The proposed request.
    pub request: RequestPacket,
}

/// Snapshot of application state for one group. `state` reflects every
/// decision below `slot` and none at or above it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Group the snapshot belongs to.
    pub paxos_id: String,
    /// Ballot promised when the snapshot was taken.
    pub ballot: Ballot,
    /// First slot not reflected in `state`.
    pub slot: Slot,
    /// Application state.
    pub state: String,
}

/// Number of acknowledgements needed out of `n` members.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}
