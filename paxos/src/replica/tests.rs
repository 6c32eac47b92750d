use super::*;
use crate::tests::RecordingApp;
use std::collections::HashSet;
use tempfile::TempDir;

const GROUP: &str = "g-1";

type Filter = Box<dyn Fn(NodeId, NodeId, &PaxosPacket) -> bool>;

struct Node {
    replica: PaxosReplica,
    app: Arc<RecordingApp>,
    tracker: Arc<ProposalTracker>,
}

/// Replicas of one group wired together by a hand-driven message queue.
struct Sim {
    nodes: Vec<Node>,
    queue: VecDeque<(NodeId, NodeId, PaxosPacket)>,
    down: HashSet<NodeId>,
    filter: Option<Filter>,
    dir: TempDir,
}

fn members(n: u32) -> BTreeSet<NodeId> {
    (0..n).collect()
}

impl Sim {
    fn new(n: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let nodes = (0..n)
            .map(|i| {
                let logger =
                    Arc::new(PaxosLogger::open(dir.path().join(i.to_string()), false).unwrap());
                let checkpoint = Checkpoint {
                    paxos_id: GROUP.into(),
                    ballot: Ballot::new(0, 0),
                    slot: 0,
                    state: "init".into(),
                };
                logger.log_start(GROUP, &members(n), &checkpoint).unwrap();
                let app = Arc::new(RecordingApp::default());
                app.update_state(GROUP, "init");
                let tracker = Arc::new(ProposalTracker::new());
                let services = Services {
                    node_id: i,
                    logger,
                    app: app.clone(),
                    tracker: tracker.clone(),
                };
                Node {
                    replica: PaxosReplica::new(GROUP.into(), members(n), services),
                    app,
                    tracker,
                }
            })
            .collect();
        Self {
            nodes,
            queue: VecDeque::new(),
            down: HashSet::new(),
            filter: None,
            dir,
        }
    }

    fn replica(&self, i: NodeId) -> &PaxosReplica {
        &self.nodes[i as usize].replica
    }

    fn values(&self, i: NodeId) -> Vec<String> {
        self.nodes[i as usize].app.values(GROUP)
    }

    fn enqueue(&mut self, from: NodeId, out: Vec<Outbound>) {
        for o in out {
            for to in o.to {
                self.queue.push_back((from, to, o.packet.clone()));
            }
        }
    }

    fn run(&mut self) {
        while let Some((from, to, packet)) = self.queue.pop_front() {
            if self.down.contains(&from) || self.down.contains(&to) {
                continue;
            }
            if let Some(f) = &self.filter {
                if f(from, to, &packet) {
                    continue;
                }
            }
            let out = self.nodes[to as usize].replica.handle(packet);
            self.enqueue(to, out);
        }
    }

    fn request(&mut self, at: NodeId, request_id: u64, value: &str) {
        let out = self.nodes[at as usize].replica.handle(PaxosPacket::Request {
            paxos_id: GROUP.into(),
            request: RequestPacket::new(at as u64, request_id, value),
        });
        self.enqueue(at, out);
        self.run();
    }

    fn check_coordinator(&mut self, at: NodeId) {
        let down = self.down.clone();
        let out = self.nodes[at as usize]
            .replica
            .check_coordinator_failure(|n| !down.contains(&n));
        self.enqueue(at, out);
        self.run();
    }

    /// What a manager's retransmission round does for node `at`.
    fn catch_up(&mut self, at: NodeId) {
        let out = self.nodes[at as usize].replica.catch_up(Duration::ZERO);
        self.enqueue(at, out);
        self.run();
    }

    /// Close every log and hand back the folder holding them.
    fn into_dir(self) -> TempDir {
        self.dir
    }
}

#[test]
fn test_all_members_decide() {
    let mut sim = Sim::new(3);
    assert_eq!(sim.replica(0).state(), ReplicaState::Coordinator);
    assert_eq!(sim.replica(1).state(), ReplicaState::Follower);

    sim.request(0, 0, "X");
    for i in 0..3 {
        assert_eq!(sim.values(i), vec!["X".to_string()]);
        assert_eq!(sim.replica(i).next_execute(), 1);
    }
    assert!(sim.nodes[0].tracker.is_empty());
}

#[test]
fn test_follower_forwards_to_coordinator() {
    let mut sim = Sim::new(3);
    sim.request(2, 0, "a");
    sim.request(1, 1, "b");
    for i in 0..3 {
        assert_eq!(sim.values(i), vec!["a".to_string(), "b".to_string()]);
    }
}

#[test]
fn test_failover_keeps_majority_accepted_value() {
    let mut sim = Sim::new(3);
    sim.request(0, 0, "A");

    // "B" is accepted by nodes 0 and 1 but the coordinator never learns it.
    sim.filter = Some(Box::new(|_: NodeId, to: NodeId, p: &PaxosPacket| {
        matches!(
            (to, p),
            (2, PaxosPacket::Accept { .. }) | (0, PaxosPacket::AcceptReply { .. })
        )
    }));
    sim.request(0, 1, "B");
    assert_eq!(sim.values(1), vec!["A".to_string()]);
    assert!(sim.nodes[0].tracker.contains(GROUP, Retransmit::Accept(1)));

    sim.filter = None;
    sim.down.insert(0);
    sim.check_coordinator(2);
    assert_eq!(sim.replica(2).state(), ReplicaState::Follower);
    sim.check_coordinator(1);

    assert_eq!(sim.replica(1).state(), ReplicaState::Coordinator);
    assert!(sim.replica(1).promised() > Ballot::new(0, 0));
    assert_eq!(sim.replica(1).promised().coordinator, 1);
    for i in 1..3 {
        assert_eq!(sim.values(i), vec!["A".to_string(), "B".to_string()]);
    }

    sim.request(2, 2, "C");
    assert_eq!(sim.values(2), vec!["A", "B", "C"]);

    // The old coordinator returns still believing in its ballot.
    sim.down.clear();
    sim.request(0, 3, "D");
    assert_eq!(sim.replica(0).state(), ReplicaState::Follower);
    assert_eq!(sim.replica(0).promised(), sim.replica(1).promised());
    assert_eq!(sim.values(1), vec!["A", "B", "C"]);

    // A later decision exposes the gap and node 0 catches up.
    sim.request(1, 4, "E");
    for i in 0..3 {
        assert_eq!(sim.values(i), vec!["A", "B", "C", "E"]);
    }
}

#[test]
fn test_election_fills_holes_with_noops() {
    let mut sim = Sim::new(3);
    // Slot 0 reaches nobody, slot 1 reaches node 1 only.
    sim.filter = Some(Box::new(|_: NodeId, to: NodeId, p: &PaxosPacket| match p {
        PaxosPacket::Accept { pvalue, .. } => pvalue.slot == 0 || to == 2,
        PaxosPacket::AcceptReply { .. } => true,
        _ => false,
    }));
    sim.request(0, 0, "lost");
    sim.request(0, 1, "kept");
    sim.filter = None;
    sim.down.insert(0);
    sim.check_coordinator(1);

    for i in 1..3 {
        assert_eq!(sim.values(i), vec!["kept".to_string()]);
        assert_eq!(sim.replica(i).next_execute(), 2);
    }
    assert!(sim.nodes[1].app.decisions(GROUP).iter().all(|r| !r.noop));
}

#[test]
fn test_ballot_monotonic() {
    let mut sim = Sim::new(3);
    let r = &mut sim.nodes[1].replica;

    let out = r.handle(PaxosPacket::Prepare {
        paxos_id: GROUP.into(),
        sender: 2,
        ballot: Ballot::new(5, 2),
    });
    assert_eq!(r.promised(), Ballot::new(5, 2));
    assert!(matches!(
        &out[0].packet,
        PaxosPacket::PrepareReply { ballot, .. } if *ballot == Ballot::new(5, 2)
    ));

    let out = r.handle(PaxosPacket::Prepare {
        paxos_id: GROUP.into(),
        sender: 0,
        ballot: Ballot::new(3, 0),
    });
    assert_eq!(r.promised(), Ballot::new(5, 2));
    assert!(matches!(
        &out[0].packet,
        PaxosPacket::PrepareReply { ballot, .. } if *ballot == Ballot::new(5, 2)
    ));

    let out = r.handle(PaxosPacket::Accept {
        paxos_id: GROUP.into(),
        sender: 0,
        pvalue: PValue {
            ballot: Ballot::new(4, 0),
            slot: 0,
            request: RequestPacket::new(0, 0, "stale"),
        },
    });
    assert!(matches!(
        &out[0].packet,
        PaxosPacket::AcceptReply { ballot, .. } if *ballot == Ballot::new(5, 2)
    ));
    assert!(r.accepted.is_empty());

    // Promises survive a restart.
    let logger = r.services.logger.clone();
    assert_eq!(logger.promised_ballot(GROUP).unwrap(), Some(Ballot::new(5, 2)));
}

#[test]
fn test_resend_until_majority() {
    let mut sim = Sim::new(3);
    sim.filter = Some(Box::new(|_: NodeId, _: NodeId, p: &PaxosPacket| {
        matches!(p, PaxosPacket::Accept { .. })
    }));
    sim.request(0, 0, "X");
    let ballot = sim.replica(0).promised();
    let kind = Retransmit::Accept(0);
    assert!(sim.nodes[0].tracker.contains(GROUP, kind));

    sim.filter = None;
    let out = sim.nodes[0].replica.resend(kind, ballot).unwrap();
    assert_eq!(out[0].to, vec![1, 2]);
    sim.enqueue(0, out);
    sim.run();

    assert!(!sim.nodes[0].tracker.contains(GROUP, kind));
    assert!(sim.nodes[0].replica.resend(kind, ballot).is_none());
    for i in 0..3 {
        assert_eq!(sim.values(i), vec!["X".to_string()]);
    }
}

#[test]
fn test_stop_request_tombstones_group() {
    let mut sim = Sim::new(3);
    sim.request(0, 0, "X");
    let out = sim.nodes[1].replica.handle(PaxosPacket::Request {
        paxos_id: GROUP.into(),
        request: RequestPacket::stop_request(1, 1),
    });
    sim.enqueue(1, out);
    sim.run();

    for i in 0..3 {
        let r = sim.replica(i);
        assert_eq!(r.state(), ReplicaState::Stopped(StopCause::Tombstone));
        assert_eq!(r.coordinator(), None);
        assert!(r.services.logger.is_stopped(GROUP).unwrap());
    }
    sim.request(0, 2, "after");
    assert_eq!(sim.values(2).len(), 2);
}

#[test]
fn test_replay_matches_live_run() {
    let mut sim = Sim::new(3);
    for (i, v) in ["a", "b", "c"].iter().enumerate() {
        sim.request(i as NodeId, i as u64, v);
    }
    sim.nodes[1].replica.log_checkpoint();
    sim.request(0, 3, "d");
    let live = sim.values(1);
    let live_state = sim.nodes[1].app.state(GROUP);
    let dir = sim.into_dir();

    let logger = Arc::new(PaxosLogger::open(dir.path().join("1"), false).unwrap());
    let app = Arc::new(RecordingApp::default());
    let services = Services {
        node_id: 1,
        logger: logger.clone(),
        app: app.clone(),
        tracker: Arc::new(ProposalTracker::new()),
    };
    let mut recovered = logger.recover(&services).unwrap();
    let r = recovered.remove("g").unwrap();

    assert_eq!(r.state(), ReplicaState::Follower);
    assert_eq!(r.next_execute(), 4);
    // The checkpoint covers a, b and c; only d is replayed.
    assert_eq!(app.values(GROUP), vec!["d".to_string()]);
    assert!(app.all_recovery(GROUP));
    assert_eq!(app.state(GROUP), live_state);
    assert_eq!(live, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_sync_after_checkpoint_sends_state() {
    let mut sim = Sim::new(3);
    sim.down.insert(2);
    sim.request(0, 0, "a");
    sim.request(0, 1, "b");
    sim.nodes[0].replica.log_checkpoint();
    sim.nodes[0]
        .replica
        .services
        .logger
        .garbage_collect()
        .unwrap();
    sim.down.clear();

    sim.request(0, 2, "c");
    // Node 2 missed slots 0 and 1, which only the checkpoint still covers.
    assert_eq!(sim.replica(2).next_execute(), 3);
    assert_eq!(
        sim.nodes[2].app.state(GROUP).as_deref(),
        Some("init|a|b|c")
    );
    assert_eq!(sim.values(2), vec!["c".to_string()]);
}

#[test]
fn test_lost_decision_recovered_by_catch_up() {
    let mut sim = Sim::new(3);
    sim.filter = Some(Box::new(|_: NodeId, to: NodeId, p: &PaxosPacket| {
        to == 2 && matches!(p, PaxosPacket::Decision { .. })
    }));
    sim.request(0, 0, "X");
    assert_eq!(sim.values(1), vec!["X".to_string()]);
    assert!(sim.values(2).is_empty());
    assert!(sim.nodes[0].tracker.is_empty());

    // Nothing else is proposed. The first round notes the stall, the next
    // one asks the coordinator.
    sim.filter = None;
    sim.catch_up(2);
    assert!(sim.values(2).is_empty());
    sim.catch_up(2);
    assert_eq!(sim.values(2), vec!["X".to_string()]);
    assert_eq!(sim.replica(2).next_execute(), 1);

    // Members that are up to date stay quiet.
    sim.catch_up(1);
    sim.catch_up(1);
    assert_eq!(sim.values(1), vec!["X".to_string()]);
}

#[test]
fn test_election_preempted_by_dead_ballot_is_retried() {
    let mut sim = Sim::new(3);
    // Node 0 got node 2 to promise a high ballot, then crashed.
    sim.nodes[2].replica.handle(PaxosPacket::Prepare {
        paxos_id: GROUP.into(),
        sender: 0,
        ballot: Ballot::new(5, 0),
    });
    sim.down.insert(0);
    sim.check_coordinator(2);
    sim.check_coordinator(1);
    assert_eq!(sim.replica(1).state(), ReplicaState::Follower);
    assert_eq!(sim.replica(1).promised(), Ballot::new(5, 0));
    assert!(sim.nodes[1].tracker.is_empty());

    // The next check outbids the ballot of the dead node.
    sim.check_coordinator(1);
    assert_eq!(sim.replica(1).state(), ReplicaState::Coordinator);
    assert_eq!(sim.replica(1).promised(), Ballot::new(6, 1));

    sim.request(2, 0, "X");
    for i in 1..3 {
        assert_eq!(sim.values(i), vec!["X".to_string()]);
    }
}

#[test]
fn test_log_failure_stops_replica() {
    let mut sim = Sim::new(3);
    sim.request(0, 0, "X");
    let read_only = PaxosLogger::open_read_only(sim.dir.path().join("2")).unwrap();
    sim.nodes[2].replica.services.logger = Arc::new(read_only);

    sim.request(0, 1, "Y");
    assert_eq!(
        sim.replica(2).state(),
        ReplicaState::Stopped(StopCause::LogFailure)
    );
    assert_eq!(sim.replica(2).coordinator(), None);
    assert_eq!(sim.values(2), vec!["X".to_string()]);
    // The remaining majority keeps deciding.
    for i in 0..2 {
        assert_eq!(sim.values(i), vec!["X", "Y"]);
    }
    sim.request(1, 2, "Z");
    assert_eq!(sim.values(0), vec!["X", "Y", "Z"]);
    assert_eq!(sim.values(2), vec!["X".to_string()]);
}

#[test]
fn test_stopped_replica_tells_stragglers() {
    let mut sim = Sim::new(3);
    sim.request(0, 0, "X");

    // Node 2 accepts the stop but never hears that it was decided.
    sim.filter = Some(Box::new(|_: NodeId, to: NodeId, p: &PaxosPacket| {
        to == 2 && matches!(p, PaxosPacket::Decision { .. })
    }));
    let out = sim.nodes[0].replica.handle(PaxosPacket::Request {
        paxos_id: GROUP.into(),
        request: RequestPacket::stop_request(0, 1),
    });
    sim.enqueue(0, out);
    sim.run();
    assert!(sim.replica(0).is_stopped());
    assert_eq!(sim.replica(2).state(), ReplicaState::Follower);

    // An accept for the stopped epoch is answered with the stop.
    let out = sim.nodes[0].replica.handle(PaxosPacket::Accept {
        paxos_id: GROUP.into(),
        sender: 2,
        pvalue: PValue {
            ballot: Ballot::new(0, 0),
            slot: 2,
            request: RequestPacket::new(2, 2, "late"),
        },
    });
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, vec![2]);
    assert!(matches!(
        &out[0].packet,
        PaxosPacket::Decision { slot: 1, request, .. } if request.stop
    ));

    sim.filter = None;
    sim.catch_up(2);
    sim.catch_up(2);
    assert_eq!(
        sim.replica(2).state(),
        ReplicaState::Stopped(StopCause::Tombstone)
    );
    assert_eq!(sim.values(2), vec!["X", ""]);
}
