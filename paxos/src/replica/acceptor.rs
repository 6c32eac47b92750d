use labrpc::anyhow::Result;
use log::{debug, trace};

use super::PaxosReplica;
use crate::packet::{Outbound, PaxosPacket};
use crate::types::{Ballot, NodeId, PValue};

impl PaxosReplica {
    /// Raise the promised ballot, durably, before anything acts on it, and
    /// step down if it belongs to another node.
    pub(super) fn promise(&mut self, ballot: Ballot) -> Result<Vec<Outbound>> {
        if ballot <= self.promised {
            return Ok(Vec::new());
        }
        self.services.logger.log_promise(&self.paxos_id, ballot)?;
        self.promised = ballot;
        if ballot.coordinator != self.me() {
            Ok(self.step_down())
        } else {
            Ok(Vec::new())
        }
    }

    pub(super) fn on_prepare(&mut self, sender: NodeId, ballot: Ballot) -> Result<Vec<Outbound>> {
        if ballot < self.promised {
            trace!(
                "{}\trejecting prepare {} from {}, promised {}",
                self.paxos_id,
                ballot,
                sender,
                self.promised
            );
            return Ok(vec![Outbound::one(
                sender,
                PaxosPacket::PrepareReply {
                    paxos_id: self.paxos_id.clone(),
                    sender: self.me(),
                    ballot: self.promised,
                    accepted: Vec::new(),
                    executed: self.next_execute,
                },
            )]);
        }
        let mut out = self.promise(ballot)?;
        debug!("{}\tpromised {} to {}", self.paxos_id, ballot, sender);
        out.push(Outbound::one(
            sender,
            PaxosPacket::PrepareReply {
                paxos_id: self.paxos_id.clone(),
                sender: self.me(),
                ballot,
                accepted: self.accepted.values().cloned().collect(),
                executed: self.next_execute,
            },
        ));
        Ok(out)
    }

    /// Accept `pvalue` unless a higher ballot was promised. Slots already
    /// executed are acknowledged without being stored again.
    pub(super) fn accept(&mut self, pvalue: &PValue) -> Result<Option<Vec<Outbound>>> {
        if pvalue.ballot < self.promised {
            return Ok(None);
        }
        let out = self.promise(pvalue.ballot)?;
        if pvalue.slot >= self.next_execute {
            self.services.logger.log_accept(&self.paxos_id, pvalue)?;
            self.accepted.insert(pvalue.slot, pvalue.clone());
        }
        Ok(Some(out))
    }

    pub(super) fn on_accept(&mut self, sender: NodeId, pvalue: PValue) -> Result<Vec<Outbound>> {
        let (mut out, ballot) = match self.accept(&pvalue)? {
            Some(out) => {
                trace!(
                    "{}\taccepted slot {} at {}",
                    self.paxos_id,
                    pvalue.slot,
                    pvalue.ballot
                );
                (out, pvalue.ballot)
            }
            None => (Vec::new(), self.promised),
        };
        out.push(Outbound::one(
            sender,
            PaxosPacket::AcceptReply {
                paxos_id: self.paxos_id.clone(),
                sender: self.me(),
                ballot,
                slot: pvalue.slot,
            },
        ));
        Ok(out)
    }
}
