use thiserror::Error;

/// Errors surfaced by the manager's public operations.
#[derive(Debug, Error)]
pub enum PaxosError {
    /// The group lost its durability guarantee and refuses new proposals.
    #[error("paxos group {0} stopped serving after a durable log failure")]
    NotServing(String),

    /// The group was tombstoned by a stop request or an epoch rollover.
    #[error("paxos group {0} is stopped")]
    Stopped(String),
}
