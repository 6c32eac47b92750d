use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};

use labrpc::tokio::time::Instant;

use crate::types::{Ballot, Slot};

/// What a coordinator has to send again when an entry expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Retransmit {
    /// The accept of a slot.
    Accept(Slot),
    /// The prepare of an election.
    Prepare,
}

/// An outstanding message found by [`ProposalTracker::expired`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pending {
    /// Group of the message.
    pub paxos_id: String,
    /// Which message.
    pub kind: Retransmit,
    /// Ballot it was sent under.
    pub ballot: Ballot,
    /// When it was last sent.
    pub issued_at: Instant,
}

type Stamp = (Instant, u64);

#[derive(Default)]
struct Inner {
    seq: u64,
    by_time: BTreeMap<Stamp, (String, Retransmit)>,
    index: HashMap<(String, Retransmit), (Stamp, Ballot)>,
}

impl Inner {
    fn remove(&mut self, paxos_id: &str, kind: Retransmit) -> bool {
        match self.index.remove(&(paxos_id.to_owned(), kind)) {
            Some((stamp, _)) => {
                self.by_time.remove(&stamp);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, paxos_id: &str, kind: Retransmit, ballot: Ballot, at: Instant) {
        self.remove(paxos_id, kind);
        self.seq += 1;
        let stamp = (at, self.seq);
        self.by_time.insert(stamp, (paxos_id.to_owned(), kind));
        self.index.insert((paxos_id.to_owned(), kind), (stamp, ballot));
    }
}

/// Accepts and prepares of every group on this node that still wait for a
/// majority, ordered by the time they were last sent.
#[derive(Default)]
pub struct ProposalTracker {
    inner: Mutex<Inner>,
}

impl ProposalTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking, replacing any older entry for the same message.
    pub fn track(&self, paxos_id: &str, kind: Retransmit, ballot: Ballot) {
        self.inner
            .lock()
            .unwrap()
            .insert(paxos_id, kind, ballot, Instant::now());
    }

    /// Stop tracking; the message reached a majority or became moot.
    pub fn remove(&self, paxos_id: &str, kind: Retransmit) -> bool {
        self.inner.lock().unwrap().remove(paxos_id, kind)
    }

    /// Stop tracking every message of a group.
    pub fn remove_group(&self, paxos_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let kinds: Vec<Retransmit> = inner
            .index
            .keys()
            .filter(|(id, _)| id == paxos_id)
            .map(|(_, kind)| *kind)
            .collect();
        for kind in kinds {
            inner.remove(paxos_id, kind);
        }
    }

    /// Entries last sent more than `age` ago, oldest first. Entries stay
    /// tracked until [`refresh`](Self::refresh)ed or removed.
    pub fn expired(&self, age: Duration) -> Vec<Pending> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for ((at, _), (paxos_id, kind)) in inner.by_time.iter() {
            if now.saturating_duration_since(*at) < age {
                break;
            }
            let ballot = inner.index[&(paxos_id.clone(), *kind)].1;
            out.push(Pending {
                paxos_id: paxos_id.clone(),
                kind: *kind,
                ballot,
                issued_at: *at,
            });
        }
        out
    }

    /// Mark an entry as just resent. Does nothing if it was removed, or
    /// replaced by a newer one, since `pending` was collected.
    pub fn refresh(&self, pending: &Pending) {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .index
            .get(&(pending.paxos_id.clone(), pending.kind))
            .copied();
        if let Some(((at, _), ballot)) = current {
            if at == pending.issued_at && ballot == pending.ballot {
                inner.insert(&pending.paxos_id, pending.kind, ballot, Instant::now());
            }
        }
    }

    /// Drop an entry found moot, unless it was replaced since.
    pub fn forget(&self, pending: &Pending) {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .index
            .get(&(pending.paxos_id.clone(), pending.kind))
            .copied();
        if let Some(((at, _), ballot)) = current {
            if at == pending.issued_at && ballot == pending.ballot {
                inner.remove(&pending.paxos_id, pending.kind);
            }
        }
    }

    /// Stop tracking everything.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = Inner::default();
    }

    /// Whether the message is tracked.
    pub fn contains(&self, paxos_id: &str, kind: Retransmit) -> bool {
        self.inner
            .lock()
            .unwrap()
            .index
            .contains_key(&(paxos_id.to_owned(), kind))
    }

    /// Number of tracked messages.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrpc::tokio;

    #[tokio::test(start_paused = true)]
    async fn test_expired_in_send_order() {
        let t = ProposalTracker::new();
        let b = Ballot::new(1, 0);
        t.track("a-1", Retransmit::Accept(0), b);
        tokio::time::advance(Duration::from_millis(10)).await;
        t.track("b-1", Retransmit::Prepare, b);
        tokio::time::advance(Duration::from_millis(10)).await;
        t.track("a-1", Retransmit::Accept(1), b);

        assert!(t.expired(Duration::from_millis(30)).is_empty());
        let e = t.expired(Duration::from_millis(10));
        assert_eq!(e.len(), 2);
        assert_eq!(e[0].paxos_id, "a-1");
        assert_eq!(e[0].kind, Retransmit::Accept(0));
        assert_eq!(e[1].kind, Retransmit::Prepare);
        // Still tracked until removed or refreshed.
        assert_eq!(t.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_and_remove() {
        let t = ProposalTracker::new();
        let b = Ballot::new(1, 0);
        t.track("a-1", Retransmit::Accept(0), b);
        tokio::time::advance(Duration::from_millis(50)).await;

        let e = t.expired(Duration::from_millis(20));
        t.refresh(&e[0]);
        assert!(t.expired(Duration::from_millis(20)).is_empty());
        assert!(t.contains("a-1", Retransmit::Accept(0)));

        assert!(t.remove("a-1", Retransmit::Accept(0)));
        assert!(!t.remove("a-1", Retransmit::Accept(0)));
        assert!(t.is_empty());

        // A stale refresh does not resurrect the entry.
        t.refresh(&e[0]);
        assert!(t.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_keeps_replacement() {
        let t = ProposalTracker::new();
        t.track("a-1", Retransmit::Prepare, Ballot::new(1, 0));
        tokio::time::advance(Duration::from_millis(50)).await;
        let stale = t.expired(Duration::from_millis(20));

        t.track("a-1", Retransmit::Prepare, Ballot::new(2, 0));
        t.forget(&stale[0]);
        assert!(t.contains("a-1", Retransmit::Prepare));

        let current = t.expired(Duration::ZERO);
        t.forget(&current[0]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_remove_group() {
        let t = ProposalTracker::new();
        let b = Ballot::new(1, 0);
        t.track("a-1", Retransmit::Accept(0), b);
        t.track("a-1", Retransmit::Prepare, b);
        t.track("b-1", Retransmit::Accept(0), b);
        t.remove_group("a-1");
        assert_eq!(t.len(), 1);
        assert!(t.contains("b-1", Retransmit::Accept(0)));
    }
}
