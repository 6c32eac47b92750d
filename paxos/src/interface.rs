use crate::types::{NodeId, RequestPacket};

/// The application layered on top of the decided logs.
///
/// Calls for one group are never concurrent and arrive in slot order; calls
/// for different groups may run concurrently.
pub trait PaxosInterface: Send + Sync + 'static {
    /// Apply the request decided for the next slot of `paxos_id`.
    /// `recovery` is set while the durable log is being replayed at startup.
    fn handle_paxos_decision(&self, paxos_id: &str, request: &RequestPacket, recovery: bool);

    /// Full application state of a group, used for checkpoints.
    fn get_state(&self, paxos_id: &str) -> Option<String>;

    /// Replace the state of a group with a checkpointed one.
    fn update_state(&self, paxos_id: &str, state: &str) -> bool;

    /// A peer went down (`up == false`) or came back.
    fn handle_failure_message(&self, _node: NodeId, _up: bool) {}
}
