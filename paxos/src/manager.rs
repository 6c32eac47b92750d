//! Process-wide registry of paxos groups.
//!
//! The manager owns every replica on a node, routes incoming packets to
//! them, runs their work on a bounded [`WorkerPool`] and drives the periodic
//! maintenance: failure detection, checkpoints, log garbage collection and
//! retransmission of unacknowledged proposals.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use labrpc::anyhow::Result;
use labrpc::tokio::{self, task::JoinHandle};
use labrpc::{async_trait, Server, Transport};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde_json::Value;

use crate::config::PaxosConfig;
use crate::error::PaxosError;
use crate::failure::FailureDetector;
use crate::interface::PaxosInterface;
use crate::logger::PaxosLogger;
use crate::packet::{Outbound, PacketType, PaxosPacket};
use crate::pool::WorkerPool;
use crate::replica::{PaxosReplica, ReplicaState, Services, StopCause};
use crate::tracker::{Pending, ProposalTracker};
use crate::types::{paxos_key, Ballot, Checkpoint, NodeId, RequestPacket};

/// Smallest group that tolerates a failure.
pub const MIN_MEMBERS: usize = 3;

/// Group created by [`PaxosManager::create_default_paxos_instance`].
pub const DEFAULT_PAXOS_ID: &str = "0-P";

type Replica = Arc<Mutex<PaxosReplica>>;

/// Hosts every paxos group of one node.
pub struct PaxosManager {
    me: Weak<PaxosManager>,
    node_id: NodeId,
    nodes: BTreeSet<NodeId>,
    config: PaxosConfig,
    services: Services,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    detector: FailureDetector,
    /// Live replica of each lookup key.
    registry: RwLock<HashMap<String, Replica>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Randomized first delay so that nodes started together do not run their
/// maintenance in lockstep.
fn initial_delay(interval: Duration) -> Duration {
    interval.mul_f64(0.5 + rand::thread_rng().gen::<f64>())
}

impl PaxosManager {
    /// Recover the groups logged under `config.log_folder/<node_id>`, then
    /// start failure detection and maintenance.
    pub async fn start(
        node_id: NodeId,
        nodes: impl IntoIterator<Item = NodeId>,
        config: PaxosConfig,
        transport: Arc<dyn Transport>,
        app: Arc<dyn PaxosInterface>,
    ) -> Result<Arc<Self>> {
        let folder = config.log_folder.join(node_id.to_string());
        let logger = PaxosLogger::open(&folder, config.sync_writes)?;
        info!("node {} opened its paxos log at {}", node_id, folder.display());
        Self::start_with_logger(node_id, nodes, config, transport, app, Arc::new(logger)).await
    }

    /// Like [`PaxosManager::start`], over a log the caller opened.
    pub async fn start_with_logger(
        node_id: NodeId,
        nodes: impl IntoIterator<Item = NodeId>,
        config: PaxosConfig,
        transport: Arc<dyn Transport>,
        app: Arc<dyn PaxosInterface>,
        logger: Arc<PaxosLogger>,
    ) -> Result<Arc<Self>> {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        let services = Services {
            node_id,
            logger,
            app,
            tracker: Arc::new(ProposalTracker::new()),
        };
        let recovered = services.logger.recover(&services)?;
        info!("node {} recovered {} paxos groups", node_id, recovered.len());

        let pool = WorkerPool::new(config.max_threads)?;
        let detector = FailureDetector::new(node_id, nodes.iter().copied(), config.failure_timeout());
        let registry = recovered
            .into_iter()
            .map(|(key, r)| (key, Arc::new(Mutex::new(r))))
            .collect();
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node_id,
            nodes,
            config,
            services,
            transport,
            pool,
            detector,
            registry: RwLock::new(registry),
            tasks: Mutex::new(Vec::new()),
        });

        for replica in manager.replicas() {
            let out = manager.check_coordinator(&replica);
            manager.send(out).await;
        }
        if manager.config.debug && manager.current_paxos_id(DEFAULT_PAXOS_ID).is_none() {
            manager.create_default_paxos_instance();
        }
        manager.schedule();
        Ok(manager)
    }

    fn schedule(self: &Arc<Self>) {
        let handles = vec![
            self.periodic("failure detection", self.config.ping_interval(), |m| {
                m.detect_failures()
            }),
            self.periodic("log garbage collection", self.config.log_delete_interval(), |m| {
                m.collect_garbage()
            }),
            self.periodic("state checkpoint", self.config.log_state_interval(), |m| {
                m.checkpoint_all()
            }),
            self.periodic("retransmission", self.config.resend_interval(), |m| {
                m.retransmit()
            }),
        ];
        self.tasks.lock().unwrap().extend(handles);
    }

    /// Run `work` after a randomized delay, then again `interval` after each
    /// run completes, until the manager is dropped.
    fn periodic<F, Fut>(self: &Arc<Self>, what: &'static str, interval: Duration, work: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(initial_delay(interval)).await;
            loop {
                match manager.upgrade() {
                    Some(m) => {
                        trace!("running {}", what);
                        work(m).await;
                    }
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Id of this node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Configuration the manager was started with.
    pub fn config(&self) -> &PaxosConfig {
        &self.config
    }

    fn replicas(&self) -> Vec<Replica> {
        self.registry.read().unwrap().values().cloned().collect()
    }

    fn lookup(&self, key: &str) -> Option<Replica> {
        self.registry.read().unwrap().get(key).cloned()
    }

    /// The replica registered under `paxos_id`'s key, if it is that epoch.
    fn lookup_exact(&self, paxos_id: &str) -> Option<Replica> {
        self.lookup(paxos_key(paxos_id))
            .filter(|r| r.lock().unwrap().paxos_id() == paxos_id)
    }

    /// Create and register a group, superseding an older epoch of the same
    /// lookup key. Returns false, changing nothing, if the membership is
    /// invalid, or the group exists or was stopped before.
    pub fn create_paxos_instance(
        &self,
        paxos_id: &str,
        members: impl IntoIterator<Item = NodeId>,
        initial_state: &str,
        election_delay: Duration,
    ) -> bool {
        let members: BTreeSet<NodeId> = members.into_iter().collect();
        if members.len() < MIN_MEMBERS {
            error!(
                "{}\tcannot create a group of {} members {:?}, need at least {}",
                paxos_id,
                members.len(),
                members,
                MIN_MEMBERS
            );
            return false;
        }
        if !members.contains(&self.node_id) {
            error!(
                "{}\tnode {} is not among members {:?}",
                paxos_id, self.node_id, members
            );
            return false;
        }

        let key = paxos_key(paxos_id).to_owned();
        let logger = &self.services.logger;
        let replica = {
            let mut registry = self.registry.write().unwrap();
            let old = registry.get(&key).cloned();
            if let Some(old) = &old {
                if old.lock().unwrap().paxos_id() == paxos_id {
                    warn!("{}\talready exists", paxos_id);
                    return false;
                }
            }
            match logger.is_stopped(paxos_id) {
                Ok(false) => {}
                Ok(true) => {
                    warn!("{}\twas stopped before, not recreating", paxos_id);
                    return false;
                }
                Err(e) => {
                    error!("{}\tcannot read durable log: {:#}", paxos_id, e);
                    return false;
                }
            }

            let first = members.iter().next().copied().unwrap_or(self.node_id);
            let checkpoint = Checkpoint {
                paxos_id: paxos_id.to_owned(),
                ballot: Ballot::new(0, first),
                slot: 0,
                state: initial_state.to_owned(),
            };
            if let Err(e) = logger.log_start(paxos_id, &members, &checkpoint) {
                error!("{}\tfailed to log group start: {:#}", paxos_id, e);
                return false;
            }
            if let Some(old) = old {
                let mut old = old.lock().unwrap();
                info!("{}\tsuperseded by {}", old.paxos_id(), paxos_id);
                old.stop();
                if let Err(e) = logger.log_stop(old.paxos_id()) {
                    error!("{}\tfailed to log stop: {:#}", old.paxos_id(), e);
                }
            }
            let replica = Arc::new(Mutex::new(PaxosReplica::new(
                paxos_id.to_owned(),
                members,
                self.services.clone(),
            )));
            registry.insert(key, replica.clone());
            replica
        };
        info!("{}\tcreated", paxos_id);
        self.check_coordinator_later(replica, election_delay);
        true
    }

    /// A group of every node, seeded from the application. Used in debug
    /// setups that have no reconfiguration subsystem.
    pub fn create_default_paxos_instance(&self) -> bool {
        let state = self
            .services
            .app
            .get_state(DEFAULT_PAXOS_ID)
            .unwrap_or_default();
        self.create_paxos_instance(
            DEFAULT_PAXOS_ID,
            self.nodes.iter().copied(),
            &state,
            Duration::ZERO,
        )
    }

    fn check_coordinator(&self, replica: &Replica) -> Vec<Outbound> {
        replica
            .lock()
            .unwrap()
            .check_coordinator_failure(|n| self.detector.is_up(n))
    }

    /// Check `replica`'s coordinator on the pool once `delay` has passed.
    /// The wait itself holds no worker.
    fn check_coordinator_later(&self, replica: Replica, delay: Duration) {
        let manager = match self.me.upgrade() {
            Some(m) => m,
            None => return,
        };
        if delay.is_zero() {
            manager.spawn_coordinator_check(replica);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.spawn_coordinator_check(replica);
        });
    }

    fn spawn_coordinator_check(self: Arc<Self>, replica: Replica) {
        let pool = self.pool.clone();
        pool.spawn("coordinator check".into(), async move {
            let out = self.check_coordinator(&replica);
            self.send(out).await;
            Ok(())
        });
    }

    /// Submit `request` to the current epoch of `paxos_id`'s group.
    ///
    /// Returns the full id of the group that took the request, which differs
    /// from `paxos_id` when the caller is behind on epochs, or `None` if no
    /// group is registered under its lookup key.
    pub fn propose(
        &self,
        paxos_id: &str,
        request: RequestPacket,
    ) -> std::result::Result<Option<String>, PaxosError> {
        let replica = match self.lookup(paxos_key(paxos_id)) {
            Some(r) => r,
            None => {
                debug!("{}\tno group to propose to", paxos_id);
                return Ok(None);
            }
        };
        let current = {
            let r = replica.lock().unwrap();
            match r.state() {
                ReplicaState::Stopped(StopCause::LogFailure) => {
                    return Err(PaxosError::NotServing(r.paxos_id().to_owned()))
                }
                ReplicaState::Stopped(StopCause::Tombstone) => {
                    return Err(PaxosError::Stopped(r.paxos_id().to_owned()))
                }
                _ => r.paxos_id().to_owned(),
            }
        };
        if current != paxos_id {
            debug!("{}\tproposal taken by epoch {}", paxos_id, current);
        }
        self.submit(PaxosPacket::Request {
            paxos_id: current.clone(),
            request,
        });
        Ok(Some(current))
    }

    fn submit(&self, packet: PaxosPacket) {
        let manager = match self.me.upgrade() {
            Some(m) => m,
            None => return,
        };
        let what = format!("{:?}", packet.packet_type());
        self.pool.spawn(what, async move {
            let out = manager.deliver(packet);
            manager.send(out).await;
            Ok(())
        });
    }

    /// Route one wire packet. Decisions are applied right away, failure
    /// detection packets go to the detector, everything else becomes a task.
    pub async fn handle_incoming_packet(&self, json: Value) -> Result<()> {
        let packet = PaxosPacket::from_json(json)?;
        match packet.packet_type() {
            PacketType::FailureDetect | PacketType::FailureResponse => {
                let (reply, change) = self.detector.handle_packet(&packet);
                self.send(reply.into_iter().collect()).await;
                if let Some((node, up)) = change {
                    self.node_status_changed(node, up).await;
                }
            }
            PacketType::Decision => {
                let out = self.deliver(packet);
                self.send(out).await;
            }
            _ => self.submit(packet),
        }
        Ok(())
    }

    fn deliver(&self, packet: PaxosPacket) -> Vec<Outbound> {
        let paxos_id = match packet.paxos_id() {
            Some(id) => id.to_owned(),
            None => return Vec::new(),
        };
        let replica = match self.lookup(paxos_key(&paxos_id)) {
            Some(r) => r,
            None => {
                warn!(
                    "{}\tno such group, dropping {:?}",
                    paxos_id,
                    packet.packet_type()
                );
                return Vec::new();
            }
        };
        let mut replica = replica.lock().unwrap();
        if replica.paxos_id() != paxos_id {
            warn!(
                "{}\tepoch mismatch with {}, dropping {:?}",
                paxos_id,
                replica.paxos_id(),
                packet.packet_type()
            );
            return Vec::new();
        }
        replica.handle(packet)
    }

    async fn send(&self, out: Vec<Outbound>) {
        for o in out {
            if o.to.is_empty() {
                continue;
            }
            let json = match o.packet.to_json() {
                Ok(j) => j,
                Err(e) => {
                    warn!("cannot encode {:?}: {}", o.packet.packet_type(), e);
                    continue;
                }
            };
            if let Err(e) = self.transport.send(&o.to, json, Some(self.node_id)).await {
                warn!("send to {:?} failed: {}", o.to, e);
            }
        }
    }

    /// Whether the failure detector believes `node` is up.
    pub fn is_node_up(&self, node: NodeId) -> bool {
        self.detector.is_up(node)
    }

    /// Report a status learned outside the failure detector.
    pub async fn inform_node_status(&self, node: NodeId, up: bool) {
        if self.detector.set_status(node, up) {
            self.node_status_changed(node, up).await;
        }
    }

    async fn node_status_changed(&self, node: NodeId, up: bool) {
        info!(
            "node {} sees node {} {}",
            self.node_id,
            node,
            if up { "up" } else { "down" }
        );
        self.services.app.handle_failure_message(node, up);
        let out = self.check_groups_with(node);
        self.send(out).await;
    }

    fn check_groups_with(&self, node: NodeId) -> Vec<Outbound> {
        let mut out = Vec::new();
        for replica in self.replicas() {
            let mut r = replica.lock().unwrap();
            if r.members().contains(&node) {
                out.extend(r.check_coordinator_failure(|n| self.detector.is_up(n)));
            }
        }
        out
    }

    fn check_all_coordinators(&self) -> Vec<Outbound> {
        let mut out = Vec::new();
        for replica in self.replicas() {
            out.extend(self.check_coordinator(&replica));
        }
        out
    }

    async fn detect_failures(self: Arc<Self>) {
        let (pings, changes) = self.detector.tick();
        self.send(pings).await;
        for (node, up) in changes {
            self.node_status_changed(node, up).await;
        }
        // A group can adopt the ballot of a node that is already down, e.g.
        // when such a ballot preempts an election, and no transition follows.
        let out = self.check_all_coordinators();
        self.send(out).await;
    }

    async fn collect_garbage(self: Arc<Self>) {
        match self.services.logger.garbage_collect() {
            Ok(n) => debug!("node {} removed {} log entries", self.node_id, n),
            Err(e) => error!("node {} log garbage collection failed: {:#}", self.node_id, e),
        }
    }

    async fn checkpoint_all(self: Arc<Self>) {
        for replica in self.replicas() {
            replica.lock().unwrap().log_checkpoint();
        }
    }

    async fn retransmit(self: Arc<Self>) {
        self.resend_expired().await;
        let age = self.config.resend_interval();
        let mut out = Vec::new();
        for replica in self.replicas() {
            out.extend(replica.lock().unwrap().catch_up(age));
        }
        self.send(out).await;
    }

    async fn resend_expired(&self) {
        for pending in self.services.tracker.expired(self.config.resend_interval()) {
            match self.resend(&pending) {
                Some(out) => {
                    self.services.tracker.refresh(&pending);
                    self.send(out).await;
                }
                None => {
                    trace!("{}\t{:?} is moot", pending.paxos_id, pending.kind);
                    self.services.tracker.forget(&pending);
                }
            }
        }
    }

    fn resend(&self, pending: &Pending) -> Option<Vec<Outbound>> {
        self.lookup_exact(&pending.paxos_id)?
            .lock()
            .unwrap()
            .resend(pending.kind, pending.ballot)
    }

    /// Number of accepts and prepares still waiting for a majority.
    pub fn outstanding(&self) -> usize {
        self.services.tracker.len()
    }

    /// Coordinator the group `paxos_id` believes in; `None` when stopped or unknown.
    pub fn coordinator_of(&self, paxos_id: &str) -> Option<NodeId> {
        self.lookup_exact(paxos_id)?.lock().unwrap().coordinator()
    }

    /// State of the replica of `paxos_id`, if that exact epoch is registered.
    pub fn replica_state(&self, paxos_id: &str) -> Option<ReplicaState> {
        Some(self.lookup_exact(paxos_id)?.lock().unwrap().state())
    }

    /// Highest ballot the replica of `paxos_id` promised.
    pub fn promised_ballot(&self, paxos_id: &str) -> Option<Ballot> {
        Some(self.lookup_exact(paxos_id)?.lock().unwrap().promised())
    }

    /// Full id of the group currently registered under `paxos_id`'s key.
    pub fn current_paxos_id(&self, paxos_id: &str) -> Option<String> {
        let replica = self.lookup(paxos_key(paxos_id))?;
        let id = replica.lock().unwrap().paxos_id().to_owned();
        Some(id)
    }

    /// Forget every group and wipe the durable log.
    pub fn reset_all(&self) -> Result<()> {
        let replicas: Vec<Replica> = self
            .registry
            .write()
            .unwrap()
            .drain()
            .map(|(_, r)| r)
            .collect();
        for r in replicas {
            r.lock().unwrap().stop();
        }
        self.services.tracker.clear();
        self.services.logger.clear_logs()?;
        warn!("node {} reset all paxos state", self.node_id);
        Ok(())
    }

    /// Stop maintenance and refuse new tasks.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.pool.close();
        info!("node {} paxos manager shut down", self.node_id);
    }
}

#[async_trait]
impl Server for PaxosManager {
    async fn handle(&self, packet: Value) -> Result<()> {
        self.handle_incoming_packet(packet).await
    }
}
