use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use labrpc::anyhow::Result;
use log::{debug, info, trace};

use super::{PaxosReplica, ReplicaState};
use crate::packet::{Outbound, PaxosPacket};
use crate::tracker::Retransmit;
use crate::types::{Ballot, NodeId, PValue, RequestPacket, Slot};

/// A value this node is replicating as coordinator.
pub(super) struct Proposal {
    pvalue: PValue,
    acks: BTreeSet<NodeId>,
}

impl PaxosReplica {
    pub(super) fn on_request(&mut self, request: RequestPacket) -> Result<Vec<Outbound>> {
        match self.state {
            ReplicaState::Coordinator => self.propose(request),
            ReplicaState::Follower if self.promised.coordinator != self.me() => {
                trace!(
                    "{}\tforwarding request to {}",
                    self.paxos_id,
                    self.promised.coordinator
                );
                Ok(vec![self.forward(request)])
            }
            ReplicaState::Stopped(_) => Ok(Vec::new()),
            _ => {
                self.queue.push_back(request);
                Ok(Vec::new())
            }
        }
    }

    fn forward(&self, request: RequestPacket) -> Outbound {
        Outbound::one(
            self.promised.coordinator,
            PaxosPacket::Request {
                paxos_id: self.paxos_id.clone(),
                request,
            },
        )
    }

    /// Give up coordination. Outstanding proposals are abandoned; requests
    /// still waiting for an election go to the new coordinator.
    pub(super) fn step_down(&mut self) -> Vec<Outbound> {
        if self.is_stopped() {
            return Vec::new();
        }
        if self.state != ReplicaState::Follower {
            info!(
                "{}\tstepping down, {} is coordinator now",
                self.paxos_id, self.promised
            );
        }
        self.state = ReplicaState::Follower;
        self.promises.clear();
        self.clear_pending();
        self.services
            .tracker
            .remove(&self.paxos_id, Retransmit::Prepare);
        if self.promised.coordinator == self.me() {
            return Vec::new();
        }
        let queued: Vec<RequestPacket> = self.queue.drain(..).collect();
        queued.into_iter().map(|r| self.forward(r)).collect()
    }

    fn clear_pending(&mut self) {
        for slot in self.pending.keys() {
            self.services
                .tracker
                .remove(&self.paxos_id, Retransmit::Accept(*slot));
        }
        self.pending.clear();
    }

    fn propose(&mut self, request: RequestPacket) -> Result<Vec<Outbound>> {
        let slot = self.next_proposal_slot;
        self.next_proposal_slot += 1;
        self.propose_at(slot, request)
    }

    fn propose_at(&mut self, slot: Slot, request: RequestPacket) -> Result<Vec<Outbound>> {
        let pvalue = PValue {
            ballot: self.promised,
            slot,
            request,
        };
        if self.accept(&pvalue)?.is_none() {
            return Ok(Vec::new());
        }
        trace!("{}\tproposing slot {} at {}", self.paxos_id, slot, pvalue.ballot);
        self.services
            .tracker
            .track(&self.paxos_id, Retransmit::Accept(slot), pvalue.ballot);
        let packet = PaxosPacket::Accept {
            paxos_id: self.paxos_id.clone(),
            sender: self.me(),
            pvalue: pvalue.clone(),
        };
        let mut acks = BTreeSet::new();
        acks.insert(self.me());
        self.pending.insert(slot, Proposal { pvalue, acks });
        Ok(vec![Outbound::new(self.others(), packet)])
    }

    /// Start an election if the believed coordinator is gone and this node is
    /// the lowest member still up.
    pub fn check_coordinator_failure(&mut self, is_up: impl Fn(NodeId) -> bool) -> Vec<Outbound> {
        if self.is_stopped() {
            return Vec::new();
        }
        let me = self.me();
        let coordinator = self.promised.coordinator;
        let healthy = if coordinator == me {
            matches!(
                self.state,
                ReplicaState::Coordinator | ReplicaState::Candidate
            )
        } else {
            self.members.contains(&coordinator) && is_up(coordinator)
        };
        if healthy {
            return Vec::new();
        }
        let expected = self
            .members
            .iter()
            .copied()
            .find(|m| *m == me || is_up(*m));
        if expected != Some(me) {
            trace!(
                "{}\tcoordinator {} is down, waiting for {:?} to take over",
                self.paxos_id, coordinator, expected
            );
            return Vec::new();
        }
        match self.run_election() {
            Ok(out) => out,
            Err(e) => {
                self.escalate(e);
                Vec::new()
            }
        }
    }

    fn run_election(&mut self) -> Result<Vec<Outbound>> {
        let ballot = self.promised.successor(self.me());
        self.promise(ballot)?;
        self.clear_pending();
        self.state = ReplicaState::Candidate;
        self.promises.clear();
        self.promises.insert(
            self.me(),
            (self.accepted.values().cloned().collect(), self.next_execute),
        );
        self.services
            .tracker
            .track(&self.paxos_id, Retransmit::Prepare, ballot);
        info!("{}\tstarting election with ballot {}", self.paxos_id, ballot);
        Ok(vec![Outbound::new(
            self.others(),
            PaxosPacket::Prepare {
                paxos_id: self.paxos_id.clone(),
                sender: self.me(),
                ballot,
            },
        )])
    }

    pub(super) fn on_prepare_reply(
        &mut self,
        sender: NodeId,
        ballot: Ballot,
        accepted: Vec<PValue>,
        executed: Slot,
    ) -> Result<Vec<Outbound>> {
        if ballot > self.promised {
            info!("{}\telection preempted by {}", self.paxos_id, ballot);
            return self.promise(ballot);
        }
        if self.state != ReplicaState::Candidate || ballot != self.promised {
            return Ok(Vec::new());
        }
        self.promises.insert(sender, (accepted, executed));
        if self.promises.len() >= self.quorum() {
            self.become_coordinator()
        } else {
            Ok(Vec::new())
        }
    }

    /// Won the election: finish whatever earlier coordinators left accepted,
    /// fill holes with noops, then serve queued requests.
    ///
    /// Slots some promiser already executed are decided, and their accepted
    /// values may have been dropped, so they are fetched by catch-up instead
    /// of being proposed again.
    fn become_coordinator(&mut self) -> Result<Vec<Outbound>> {
        let promises = std::mem::take(&mut self.promises);
        self.state = ReplicaState::Coordinator;
        self.services
            .tracker
            .remove(&self.paxos_id, Retransmit::Prepare);

        let mut best: BTreeMap<Slot, PValue> = BTreeMap::new();
        let mut executed = self.next_execute;
        let mut ahead = None;
        for (node, (accepted, node_executed)) in promises {
            if node_executed > executed {
                executed = node_executed;
                ahead = Some(node);
            }
            for p in accepted {
                match best.entry(p.slot) {
                    Entry::Vacant(e) => {
                        e.insert(p);
                    }
                    Entry::Occupied(mut e) => {
                        if p.ballot > e.get().ballot {
                            e.insert(p);
                        }
                    }
                }
            }
        }
        let end = best.keys().next_back().map_or(0, |s| s + 1).max(executed);
        info!(
            "{}\tcoordinator at {}, recovering slots {}..{}",
            self.paxos_id, self.promised, executed, end
        );

        let mut out = Vec::new();
        for slot in executed..end {
            let request = best
                .remove(&slot)
                .map_or_else(RequestPacket::noop, |p| p.request);
            out.extend(self.propose_at(slot, request)?);
        }
        self.next_proposal_slot = end.max(self.next_execute);
        if let Some(peer) = ahead.filter(|_| self.next_execute < executed) {
            out.extend(self.sync_request(peer));
        }
        while let Some(request) = self.queue.pop_front() {
            out.extend(self.propose(request)?);
        }
        Ok(out)
    }

    pub(super) fn on_accept_reply(
        &mut self,
        sender: NodeId,
        ballot: Ballot,
        slot: Slot,
    ) -> Result<Vec<Outbound>> {
        if ballot > self.promised {
            info!("{}\tproposal preempted by {}", self.paxos_id, ballot);
            return self.promise(ballot);
        }
        if self.state != ReplicaState::Coordinator || ballot != self.promised {
            return Ok(Vec::new());
        }
        let quorum = self.quorum();
        let reached = match self.pending.get_mut(&slot) {
            Some(p) if p.pvalue.ballot == ballot => {
                p.acks.insert(sender);
                p.acks.len() >= quorum
            }
            _ => return Ok(Vec::new()),
        };
        if !reached {
            return Ok(Vec::new());
        }
        self.decide(slot)
    }

    fn decide(&mut self, slot: Slot) -> Result<Vec<Outbound>> {
        let proposal = match self.pending.remove(&slot) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        self.services
            .tracker
            .remove(&self.paxos_id, Retransmit::Accept(slot));
        let request = proposal.pvalue.request;
        let packet = self.decision_packet(slot, request.clone());
        self.commit(slot, request)?;
        Ok(vec![Outbound::new(self.others(), packet)])
    }

    /// Send an unacknowledged accept or prepare again to the members that
    /// have not answered. `None` if it no longer matters.
    pub fn resend(&mut self, kind: Retransmit, ballot: Ballot) -> Option<Vec<Outbound>> {
        if self.is_stopped() || ballot != self.promised {
            return None;
        }
        match kind {
            Retransmit::Accept(slot) => {
                if self.state != ReplicaState::Coordinator {
                    return None;
                }
                let p = self.pending.get(&slot).filter(|p| p.pvalue.ballot == ballot)?;
                let missing: Vec<NodeId> = self
                    .members
                    .iter()
                    .copied()
                    .filter(|m| !p.acks.contains(m))
                    .collect();
                debug!(
                    "{}\tresending accept for slot {} to {:?}",
                    self.paxos_id, slot, missing
                );
                Some(vec![Outbound::new(
                    missing,
                    PaxosPacket::Accept {
                        paxos_id: self.paxos_id.clone(),
                        sender: self.me(),
                        pvalue: p.pvalue.clone(),
                    },
                )])
            }
            Retransmit::Prepare => {
                if self.state != ReplicaState::Candidate {
                    return None;
                }
                let missing: Vec<NodeId> = self
                    .members
                    .iter()
                    .copied()
                    .filter(|m| !self.promises.contains_key(m))
                    .collect();
                debug!("{}\tresending prepare {} to {:?}", self.paxos_id, ballot, missing);
                Some(vec![Outbound::new(
                    missing,
                    PaxosPacket::Prepare {
                        paxos_id: self.paxos_id.clone(),
                        sender: self.me(),
                        ballot,
                    },
                )])
            }
        }
    }
}
