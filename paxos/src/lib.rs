#![deny(missing_docs)]
#![deny(clippy::all)]
//! Multi-instance paxos.
//!
//! A [`PaxosManager`] per node hosts many independent paxos groups, each a
//! replicated log of [`RequestPacket`]s. Decided requests are handed to the
//! application through [`PaxosInterface`] in slot order.

mod config;
mod error;
mod failure;
mod interface;
mod logger;
mod manager;
mod packet;
mod persistor;
mod pool;
mod replica;
mod tracker;
mod types;


pub use config::PaxosConfig;
pub use error::PaxosError;
pub use failure::FailureDetector;
pub use interface::PaxosInterface;
pub use logger::{GroupMeta, PaxosLogger};
pub use manager::{PaxosManager, DEFAULT_PAXOS_ID, MIN_MEMBERS};
pub use packet::{Outbound, PacketType, PaxosPacket, PACKET_TYPE};
pub use persistor::{Batch, Persistor};
pub use pool::WorkerPool;
pub use replica::{PaxosReplica, ReplicaState, Services, StopCause};
pub use tracker::{Pending, ProposalTracker, Retransmit};
pub use types::{
    majority, paxos_key, Ballot, Checkpoint, GroupRole, NodeId, PValue, RequestPacket, Slot,
    PRIMARY_SUFFIX,
};
