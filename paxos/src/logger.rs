//! Durable write-ahead log of every paxos group on this node.
//!
//! Each group keeps a start record, its latest checkpoint, the decisions and
//! accepted pvalues above that checkpoint, and the highest ballot it has
//! promised. Replaying these rebuilds the group after a restart.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use labrpc::anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::persistor::{Batch, Persistor};
use crate::replica::{PaxosReplica, Services};
use crate::types::{paxos_key, Ballot, Checkpoint, NodeId, PValue, RequestPacket, Slot};

const SEP: char = '\u{1f}';
const META: &str = "meta";
const CHECKPOINT: &str = "ckpt";
const DECISION: &str = "dec";
const ACCEPTED: &str = "acc";
const PROMISED: &str = "ballot";
const SLOT_DIGITS: usize = 20;

/// Start record of a group. Stays behind as a tombstone once `stopped`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMeta {
    /// Full id of the group.
    pub paxos_id: String,
    /// Members fixed at creation.
    pub members: BTreeSet<NodeId>,
    /// Order of `log_start` calls on this node.
    pub seq: u64,
    /// Set once the group is tombstoned.
    pub stopped: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DecisionRecord {
    slot: Slot,
    request: RequestPacket,
}

fn key(kind: &str, paxos_id: &str) -> String {
    format!("{}{}{}", kind, SEP, paxos_id)
}

fn slot_prefix(kind: &str, paxos_id: &str) -> String {
    format!("{}{}{}{}", kind, SEP, paxos_id, SEP)
}

fn slot_key(kind: &str, paxos_id: &str, slot: Slot) -> String {
    format!("{}{:020}", slot_prefix(kind, paxos_id), slot)
}

fn slot_of(key: &[u8]) -> Option<Slot> {
    if key.len() < SLOT_DIGITS {
        return None;
    }
    std::str::from_utf8(&key[key.len() - SLOT_DIGITS..])
        .ok()?
        .parse()
        .ok()
}

/// Durable log shared by every group on a node, on top of a [`Persistor`].
pub struct PaxosLogger {
    db: Persistor,
    next_seq: AtomicU64,
    /// Serializes read-modify-write of start records.
    meta_lock: Mutex<()>,
}

impl PaxosLogger {
    /// Open (or create) the log in `folder`.
    pub fn open<P: AsRef<Path>>(folder: P, sync: bool) -> Result<Self> {
        Self::over(Persistor::open(folder, sync)?)
    }

    /// Open an existing log for inspection. Groups recover from it, but
    /// every write fails.
    pub fn open_read_only<P: AsRef<Path>>(folder: P) -> Result<Self> {
        Self::over(Persistor::open_read_only(folder)?)
    }

    fn over(db: Persistor) -> Result<Self> {
        let next_seq = db
            .scan::<GroupMeta>(key(META, "").as_bytes())?
            .iter()
            .map(|(_, m)| m.seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
            meta_lock: Mutex::new(()),
        })
    }

    /// Record the creation of a group together with its seed checkpoint.
    pub fn log_start(
        &self,
        paxos_id: &str,
        members: &BTreeSet<NodeId>,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let _guard = self.meta_lock.lock().unwrap();
        let meta = GroupMeta {
            paxos_id: paxos_id.to_owned(),
            members: members.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            stopped: false,
        };
        let mut batch = Batch::default();
        batch.set(key(META, paxos_id), &meta)?;
        batch.set(key(CHECKPOINT, paxos_id), checkpoint)?;
        batch.set(key(PROMISED, paxos_id), &checkpoint.ballot)?;
        self.db.write(batch)?;
        debug!("{}\tlogged start, members {:?}", paxos_id, members);
        Ok(())
    }

    /// Write-ahead record of a decision; must return before the decision is
    /// executed.
    pub fn log_decision(&self, paxos_id: &str, slot: Slot, request: &RequestPacket) -> Result<()> {
        self.db.set(
            slot_key(DECISION, paxos_id, slot),
            &DecisionRecord {
                slot,
                request: request.clone(),
            },
        )
    }

    /// Store a checkpoint, replacing the previous one of its group.
    pub fn log_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.db.set(key(CHECKPOINT, &checkpoint.paxos_id), checkpoint)
    }

    /// Store the highest ballot promised by a group.
    pub fn log_promise(&self, paxos_id: &str, ballot: Ballot) -> Result<()> {
        self.db.set(key(PROMISED, paxos_id), &ballot)
    }

    /// Store a pvalue accepted for its slot.
    pub fn log_accept(&self, paxos_id: &str, pvalue: &PValue) -> Result<()> {
        self.db.set(slot_key(ACCEPTED, paxos_id, pvalue.slot), pvalue)
    }

    /// Tombstone a group so recovery never brings it back.
    pub fn log_stop(&self, paxos_id: &str) -> Result<()> {
        let _guard = self.meta_lock.lock().unwrap();
        let meta = match self.db.get::<_, GroupMeta>(key(META, paxos_id))? {
            Some(m) if m.stopped => return Ok(()),
            Some(m) => GroupMeta { stopped: true, ..m },
            None => GroupMeta {
                paxos_id: paxos_id.to_owned(),
                members: BTreeSet::new(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                stopped: true,
            },
        };
        self.db.set(key(META, paxos_id), &meta)?;
        info!("{}\tlogged stop", paxos_id);
        Ok(())
    }

    /// Start record of a group, if it was ever started here.
    pub fn group_meta(&self, paxos_id: &str) -> Result<Option<GroupMeta>> {
        self.db.get(key(META, paxos_id))
    }

    /// Whether a group was tombstoned.
    pub fn is_stopped(&self, paxos_id: &str) -> Result<bool> {
        Ok(self.group_meta(paxos_id)?.is_some_and(|m| m.stopped))
    }

    /// Most recent checkpoint of a group.
    pub fn latest_checkpoint(&self, paxos_id: &str) -> Result<Option<Checkpoint>> {
        self.db.get(key(CHECKPOINT, paxos_id))
    }

    /// Highest ballot a group promised, if it promised any.
    pub fn promised_ballot(&self, paxos_id: &str) -> Result<Option<Ballot>> {
        self.db.get(key(PROMISED, paxos_id))
    }

    /// Logged decisions at or above `from`, in slot order.
    pub fn load_decisions(&self, paxos_id: &str, from: Slot) -> Result<Vec<(Slot, RequestPacket)>> {
        Ok(self
            .db
            .scan::<DecisionRecord>(slot_prefix(DECISION, paxos_id).as_bytes())?
            .into_iter()
            .map(|(_, d)| (d.slot, d.request))
            .filter(|(slot, _)| *slot >= from)
            .collect())
    }

    /// Accepted pvalues of a group at or above slot `from`.
    pub fn load_accepted(&self, paxos_id: &str, from: Slot) -> Result<Vec<PValue>> {
        Ok(self
            .db
            .scan::<PValue>(slot_prefix(ACCEPTED, paxos_id).as_bytes())?
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.slot >= from)
            .collect())
    }

    fn groups(&self) -> Result<Vec<GroupMeta>> {
        Ok(self
            .db
            .scan::<GroupMeta>(key(META, "").as_bytes())?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    /// Rebuild every group that is not tombstoned, keyed by lookup key.
    ///
    /// If two live epochs of the same key are found (a crash between starting
    /// the new one and stopping the old one), the later start wins and the
    /// other is tombstoned now.
    pub fn recover(&self, services: &Services) -> Result<HashMap<String, PaxosReplica>> {
        let mut latest: HashMap<String, GroupMeta> = HashMap::new();
        for meta in self.groups()?.into_iter().filter(|m| !m.stopped) {
            let k = paxos_key(&meta.paxos_id).to_owned();
            match latest.get(&k) {
                Some(prev) if prev.seq > meta.seq => {
                    warn!("{}\tsuperseded by {}, stopping", meta.paxos_id, prev.paxos_id);
                    self.log_stop(&meta.paxos_id)?;
                }
                Some(prev) => {
                    warn!("{}\tsuperseded by {}, stopping", prev.paxos_id, meta.paxos_id);
                    self.log_stop(&prev.paxos_id)?;
                    latest.insert(k, meta);
                }
                None => {
                    latest.insert(k, meta);
                }
            }
        }

        let mut replicas = HashMap::new();
        for (k, meta) in latest {
            let checkpoint = match self.latest_checkpoint(&meta.paxos_id)? {
                Some(c) => c,
                None => {
                    warn!("{}\tno checkpoint in log, skipping recovery", meta.paxos_id);
                    continue;
                }
            };
            let promised = self
                .promised_ballot(&meta.paxos_id)?
                .unwrap_or(checkpoint.ballot)
                .max(checkpoint.ballot);
            let accepted = self.load_accepted(&meta.paxos_id, checkpoint.slot)?;
            let decisions = self.load_decisions(&meta.paxos_id, checkpoint.slot)?;
            info!(
                "{}\trecovering from slot {} with {} decisions",
                meta.paxos_id,
                checkpoint.slot,
                decisions.len()
            );
            let replica = PaxosReplica::restore(
                meta.paxos_id,
                meta.members,
                services.clone(),
                promised,
                checkpoint,
                accepted,
                decisions,
            );
            replicas.insert(k, replica);
        }
        Ok(replicas)
    }

    /// Delete log entries made redundant by a later checkpoint, and all but
    /// the tombstone of stopped groups. Returns the number of entries removed.
    pub fn garbage_collect(&self) -> Result<usize> {
        let mut batch = Batch::default();
        for meta in self.groups()? {
            let id = &meta.paxos_id;
            let below = if meta.stopped {
                batch.remove(key(CHECKPOINT, id));
                batch.remove(key(PROMISED, id));
                Slot::MAX
            } else {
                match self.latest_checkpoint(id)? {
                    Some(c) => c.slot,
                    None => continue,
                }
            };
            for kind in [DECISION, ACCEPTED] {
                for k in self.db.scan_keys(slot_prefix(kind, id).as_bytes())? {
                    if slot_of(&k).is_some_and(|s| s < below) {
                        batch.remove(k);
                    }
                }
            }
        }
        let removed = batch.len();
        if !batch.is_empty() {
            self.db.write(batch)?;
        }
        debug!("log garbage collection removed {} entries", removed);
        Ok(removed)
    }

    /// Drop every record of every group.
    pub fn clear_logs(&self) -> Result<()> {
        let mut batch = Batch::default();
        for k in self.db.scan_keys(b"")? {
            batch.remove(k);
        }
        self.db.write(batch)
    }
}
