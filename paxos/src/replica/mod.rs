//! One paxos group as seen by one of its members.
//!
//! A replica plays all three paxos roles for its group. Handlers are plain
//! synchronous state transitions that return the packets to send; the
//! manager serializes calls per group and does the sending.

mod acceptor;
mod coordinator;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use labrpc::anyhow::Result;
use labrpc::tokio::time::Instant;
use log::{debug, error, info, trace, warn};

use crate::interface::PaxosInterface;
use crate::logger::PaxosLogger;
use crate::packet::{Outbound, PaxosPacket};
use crate::tracker::{ProposalTracker, Retransmit};
use crate::types::{
    majority, Ballot, Checkpoint, GroupRole, NodeId, PValue, RequestPacket, Slot,
};

use coordinator::Proposal;

/// Minimum gap between two catch-up requests for the same missing slot.
const SYNC_BACKOFF: Duration = Duration::from_millis(1000);

/// Node-wide collaborators shared by every replica on a node.
#[derive(Clone)]
pub struct Services {
    /// This node.
    pub node_id: NodeId,
    /// The node's durable log.
    pub logger: Arc<PaxosLogger>,
    /// Application receiving decisions.
    pub app: Arc<dyn PaxosInterface>,
    /// Unacknowledged messages of every group on the node.
    pub tracker: Arc<ProposalTracker>,
}

/// Why a replica stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    /// A stop request was decided or the epoch was superseded.
    Tombstone,
    /// A durable log write failed; decisions can no longer be made durable.
    LogFailure,
}

/// Role a replica currently plays in its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    /// Accepts and learns for the coordinator of the promised ballot.
    Follower,
    /// Running an election for its own ballot.
    Candidate,
    /// Proposes under its own ballot.
    Coordinator,
    /// Serves nothing anymore.
    Stopped(StopCause),
}

/// State machine of one group on one member.
pub struct PaxosReplica {
    paxos_id: String,
    role: GroupRole,
    members: BTreeSet<NodeId>,
    services: Services,
    state: ReplicaState,

    /// Highest ballot promised. Never decreases.
    promised: Ballot,
    /// Accepted pvalues of slots not yet executed.
    accepted: BTreeMap<Slot, PValue>,

    /// Decided but not yet executed, waiting for earlier slots.
    decided: BTreeMap<Slot, RequestPacket>,
    /// First slot not handed to the application.
    next_execute: Slot,
    last_sync: Option<(Slot, Instant)>,
    /// When `next_execute` was first seen stuck behind accepted slots.
    stalled: Option<(Slot, Instant)>,
    /// Slot and request of the decided stop, kept to answer stragglers.
    stopped_at: Option<(Slot, RequestPacket)>,

    next_proposal_slot: Slot,
    pending: BTreeMap<Slot, Proposal>,
    promises: HashMap<NodeId, (Vec<PValue>, Slot)>,
    queue: VecDeque<RequestPacket>,
}

impl PaxosReplica {
    /// A fresh group at slot 0. The lowest member starts as coordinator of
    /// ballot `0:<lowest>`, which every member starts out promising.
    pub fn new(paxos_id: String, members: BTreeSet<NodeId>, services: Services) -> Self {
        let first = members.iter().next().copied().unwrap_or(services.node_id);
        let state = if first == services.node_id {
            ReplicaState::Coordinator
        } else {
            ReplicaState::Follower
        };
        Self::blank(paxos_id, members, services, Ballot::new(0, first), state)
    }

    fn blank(
        paxos_id: String,
        members: BTreeSet<NodeId>,
        services: Services,
        promised: Ballot,
        state: ReplicaState,
    ) -> Self {
        Self {
            role: GroupRole::of(&paxos_id),
            paxos_id,
            members,
            services,
            state,
            promised,
            accepted: BTreeMap::new(),
            decided: BTreeMap::new(),
            next_execute: 0,
            last_sync: None,
            stalled: None,
            stopped_at: None,
            next_proposal_slot: 0,
            pending: BTreeMap::new(),
            promises: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Rebuild a group from its durable log: install the checkpoint, then
    /// replay the logged decisions above it. Replayed decisions reach the
    /// application with `recovery` set and are not logged again.
    pub fn restore(
        paxos_id: String,
        members: BTreeSet<NodeId>,
        services: Services,
        promised: Ballot,
        checkpoint: Checkpoint,
        accepted: Vec<PValue>,
        decisions: Vec<(Slot, RequestPacket)>,
    ) -> Self {
        let mut r = Self::blank(
            paxos_id,
            members,
            services,
            promised,
            ReplicaState::Follower,
        );
        r.services.app.update_state(&r.paxos_id, &checkpoint.state);
        r.next_execute = checkpoint.slot;
        r.accepted = accepted
            .into_iter()
            .filter(|p| p.slot >= checkpoint.slot)
            .map(|p| (p.slot, p))
            .collect();
        r.decided = decisions
            .into_iter()
            .filter(|(slot, _)| *slot >= checkpoint.slot)
            .collect();
        if let Err(e) = r.execute_ready(true) {
            r.escalate(e);
        }
        r.next_proposal_slot = r.next_free_slot();
        r
    }

    /// Full id of the group.
    pub fn paxos_id(&self) -> &str {
        &self.paxos_id
    }

    /// Whether the group is a primary or an active one.
    pub fn role(&self) -> GroupRole {
        self.role
    }

    /// Members of the group.
    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Current role.
    pub fn state(&self) -> ReplicaState {
        self.state
    }

    /// Highest ballot promised.
    pub fn promised(&self) -> Ballot {
        self.promised
    }

    /// First slot not yet handed to the application.
    pub fn next_execute(&self) -> Slot {
        self.next_execute
    }

    /// Whether the replica was stopped.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, ReplicaState::Stopped(_))
    }

    /// Node this replica believes coordinates the group.
    pub fn coordinator(&self) -> Option<NodeId> {
        match self.state {
            ReplicaState::Stopped(_) => None,
            _ => Some(self.promised.coordinator),
        }
    }

    fn me(&self) -> NodeId {
        self.services.node_id
    }

    fn quorum(&self) -> usize {
        majority(self.members.len())
    }

    fn others(&self) -> Vec<NodeId> {
        let me = self.me();
        self.members.iter().copied().filter(|m| *m != me).collect()
    }

    fn next_free_slot(&self) -> Slot {
        let after = |s: Option<&Slot>| s.map_or(0, |s| s + 1);
        self.next_execute
            .max(after(self.accepted.keys().next_back()))
            .max(after(self.decided.keys().next_back()))
    }

    /// Apply one incoming packet. A durable log failure stops the replica
    /// instead of surfacing to the caller.
    pub fn handle(&mut self, packet: PaxosPacket) -> Vec<Outbound> {
        if self.is_stopped() {
            return self.acknowledge_stop(&packet);
        }
        match self.dispatch(packet) {
            Ok(out) => out,
            Err(e) => {
                self.escalate(e);
                Vec::new()
            }
        }
    }

    fn dispatch(&mut self, packet: PaxosPacket) -> Result<Vec<Outbound>> {
        use PaxosPacket::*;
        match packet {
            Request { request, .. } => self.on_request(request),
            Prepare { sender, ballot, .. } => self.on_prepare(sender, ballot),
            PrepareReply {
                sender,
                ballot,
                accepted,
                executed,
                ..
            } => self.on_prepare_reply(sender, ballot, accepted, executed),
            Accept { sender, pvalue, .. } => self.on_accept(sender, pvalue),
            AcceptReply {
                sender,
                ballot,
                slot,
                ..
            } => self.on_accept_reply(sender, ballot, slot),
            Decision {
                sender,
                slot,
                request,
                ..
            } => self.on_decision(sender, slot, request),
            SyncRequest { sender, from, .. } => self.on_sync_request(sender, from),
            SyncReply {
                checkpoint,
                decisions,
                ..
            } => self.on_sync_reply(checkpoint, decisions),
            FailureDetect { .. } | FailureResponse { .. } => Ok(Vec::new()),
        }
    }

    fn escalate(&mut self, e: labrpc::anyhow::Error) {
        error!(
            "{}\tdurable log failure, group stops serving: {:#}",
            self.paxos_id, e
        );
        self.state = ReplicaState::Stopped(StopCause::LogFailure);
        self.services.tracker.remove_group(&self.paxos_id);
    }

    /// Tombstone the replica in memory. The caller logs the stop.
    pub fn stop(&mut self) {
        if !self.is_stopped() {
            info!("{}\tstopped", self.paxos_id);
            self.state = ReplicaState::Stopped(StopCause::Tombstone);
        }
        self.services.tracker.remove_group(&self.paxos_id);
    }

    /// Durably snapshot the application state of this group.
    pub fn log_checkpoint(&mut self) {
        if self.is_stopped() {
            return;
        }
        let state = match self.services.app.get_state(&self.paxos_id) {
            Some(s) => s,
            None => return,
        };
        let checkpoint = Checkpoint {
            paxos_id: self.paxos_id.clone(),
            ballot: self.promised,
            slot: self.next_execute,
            state,
        };
        if let Err(e) = self.services.logger.log_checkpoint(&checkpoint) {
            self.escalate(e);
        } else {
            debug!("{}\tcheckpoint at slot {}", self.paxos_id, checkpoint.slot);
        }
    }

    fn decision_packet(&self, slot: Slot, request: RequestPacket) -> PaxosPacket {
        PaxosPacket::Decision {
            paxos_id: self.paxos_id.clone(),
            sender: self.me(),
            slot,
            request,
        }
    }

    /// Log a decision, then execute everything that became contiguous.
    fn commit(&mut self, slot: Slot, request: RequestPacket) -> Result<()> {
        if slot < self.next_execute || self.decided.contains_key(&slot) {
            return Ok(());
        }
        self.services
            .logger
            .log_decision(&self.paxos_id, slot, &request)?;
        trace!("{}\tdecided slot {}", self.paxos_id, slot);
        self.decided.insert(slot, request);
        if self.pending.remove(&slot).is_some() {
            self.services
                .tracker
                .remove(&self.paxos_id, Retransmit::Accept(slot));
        }
        self.execute_ready(false)
    }

    fn execute_ready(&mut self, recovery: bool) -> Result<()> {
        while let Some(request) = self.decided.remove(&self.next_execute) {
            let slot = self.next_execute;
            self.next_execute += 1;
            self.accepted.remove(&slot);
            if !request.noop {
                self.services
                    .app
                    .handle_paxos_decision(&self.paxos_id, &request, recovery);
            }
            if request.stop {
                info!("{}\tstop request decided at slot {}", self.paxos_id, slot);
                self.stopped_at = Some((slot, request));
                self.services.logger.log_stop(&self.paxos_id)?;
                self.stop();
                self.decided.clear();
                break;
            }
        }
        self.accepted = self.accepted.split_off(&self.next_execute);
        Ok(())
    }

    fn has_gap(&self) -> bool {
        self.decided
            .keys()
            .next()
            .is_some_and(|first| *first > self.next_execute)
    }

    fn sync_request(&mut self, peer: NodeId) -> Option<Outbound> {
        let now = Instant::now();
        if let Some((slot, at)) = self.last_sync {
            if slot == self.next_execute && now.duration_since(at) < SYNC_BACKOFF {
                return None;
            }
        }
        self.last_sync = Some((self.next_execute, now));
        debug!(
            "{}\tbehind at slot {}, asking {} to catch up",
            self.paxos_id, self.next_execute, peer
        );
        Some(Outbound::one(
            peer,
            PaxosPacket::SyncRequest {
                paxos_id: self.paxos_id.clone(),
                sender: self.me(),
                from: self.next_execute,
            },
        ))
    }

    fn on_decision(
        &mut self,
        sender: NodeId,
        slot: Slot,
        request: RequestPacket,
    ) -> Result<Vec<Outbound>> {
        self.commit(slot, request)?;
        let mut out = Vec::new();
        if !self.is_stopped() && self.has_gap() && sender != self.me() {
            out.extend(self.sync_request(sender));
        }
        Ok(out)
    }

    fn on_sync_request(&mut self, sender: NodeId, from: Slot) -> Result<Vec<Outbound>> {
        let (checkpoint, decisions) = self.sync_contents(from)?;
        if checkpoint.is_none() && decisions.is_empty() {
            return Ok(Vec::new());
        }
        trace!(
            "{}\tsync for {} from slot {}: {} decisions",
            self.paxos_id,
            sender,
            from,
            decisions.len()
        );
        Ok(vec![self.sync_reply(sender, checkpoint, decisions)])
    }

    /// The latest checkpoint past `from`, if any, and the logged decisions
    /// after whichever of the two is later.
    fn sync_contents(
        &self,
        from: Slot,
    ) -> Result<(Option<Checkpoint>, Vec<(Slot, RequestPacket)>)> {
        let logger = &self.services.logger;
        let checkpoint = logger
            .latest_checkpoint(&self.paxos_id)?
            .filter(|c| c.slot > from);
        let start = checkpoint.as_ref().map_or(from, |c| c.slot);
        let decisions = logger.load_decisions(&self.paxos_id, start)?;
        Ok((checkpoint, decisions))
    }

    fn sync_reply(
        &self,
        to: NodeId,
        checkpoint: Option<Checkpoint>,
        decisions: Vec<(Slot, RequestPacket)>,
    ) -> Outbound {
        Outbound::one(
            to,
            PaxosPacket::SyncReply {
                paxos_id: self.paxos_id.clone(),
                sender: self.me(),
                checkpoint,
                decisions,
            },
        )
    }

    /// A stopped replica still answers members working on its epoch: an
    /// accept or prepare gets the stop decision, a catch-up request gets
    /// whatever the log holds up to and including the stop.
    fn acknowledge_stop(&self, packet: &PaxosPacket) -> Vec<Outbound> {
        let (slot, request) = match &self.stopped_at {
            Some((slot, request)) => (*slot, request.clone()),
            None => {
                trace!("{}\tstopped, dropping {:?}", self.paxos_id, packet.packet_type());
                return Vec::new();
            }
        };
        match *packet {
            PaxosPacket::Accept { sender, .. } | PaxosPacket::Prepare { sender, .. }
                if sender != self.me() =>
            {
                debug!("{}\tstopped, telling {} about the stop", self.paxos_id, sender);
                vec![Outbound::one(sender, self.decision_packet(slot, request))]
            }
            PaxosPacket::SyncRequest { sender, from, .. } if sender != self.me() => {
                let (checkpoint, mut decisions) = match self.sync_contents(from) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("{}\tcannot read decisions for {}: {:#}", self.paxos_id, sender, e);
                        (None, Vec::new())
                    }
                };
                decisions.retain(|(s, _)| *s < slot);
                decisions.push((slot, request));
                vec![self.sync_reply(sender, checkpoint, decisions)]
            }
            _ => Vec::new(),
        }
    }

    /// Ask the coordinator for decisions this follower should have learned
    /// by now. Fires once `next_execute` has been stuck for `age` behind a
    /// slot it accepted or saw decided, so a lost decision is recovered
    /// without waiting for later traffic.
    pub fn catch_up(&mut self, age: Duration) -> Vec<Outbound> {
        let coordinator = self.promised.coordinator;
        if self.state != ReplicaState::Follower || coordinator == self.me() {
            return Vec::new();
        }
        if self.accepted.is_empty() && self.decided.is_empty() {
            self.stalled = None;
            return Vec::new();
        }
        let now = Instant::now();
        match self.stalled {
            Some((slot, since)) if slot == self.next_execute => {
                if now.duration_since(since) < age {
                    return Vec::new();
                }
            }
            _ => {
                self.stalled = Some((self.next_execute, now));
                return Vec::new();
            }
        }
        self.sync_request(coordinator).into_iter().collect()
    }

    fn on_sync_reply(
        &mut self,
        checkpoint: Option<Checkpoint>,
        decisions: Vec<(Slot, RequestPacket)>,
    ) -> Result<Vec<Outbound>> {
        if let Some(c) = checkpoint.filter(|c| c.slot > self.next_execute) {
            info!(
                "{}\tjumping from slot {} to peer checkpoint at {}",
                self.paxos_id, self.next_execute, c.slot
            );
            let c = Checkpoint {
                paxos_id: self.paxos_id.clone(),
                ..c
            };
            self.services.logger.log_checkpoint(&c)?;
            self.services.app.update_state(&self.paxos_id, &c.state);
            self.next_execute = c.slot;
            self.decided = self.decided.split_off(&c.slot);
            self.accepted = self.accepted.split_off(&c.slot);
            self.next_proposal_slot = self.next_proposal_slot.max(c.slot);
            self.execute_ready(false)?;
        }
        for (slot, request) in decisions {
            if self.is_stopped() {
                break;
            }
            self.commit(slot, request)?;
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests;
