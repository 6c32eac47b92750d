use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labrpc::anyhow;
use labrpc::{async_trait, Server, Transport};
use log::{error, info, warn};
use paxos::{paxos_key, NodeId, PaxosConfig, PaxosError, PaxosManager, RequestPacket};
use serde_json::Value;
use thiserror::Error;

use crate::record::{NameTable, Operation};
use crate::store::NameRecordStore;

/// Paxos id of `name` in `epoch`.
pub fn versioned(name: &str, epoch: u64) -> String {
    format!("{}-{}", name, epoch)
}

fn epoch_of(paxos_id: &str) -> Option<u64> {
    paxos_id.rsplit('-').next()?.parse().ok()
}

/// Errors of [`NameServer`] operations.
#[derive(Debug, Error)]
pub enum NameError {
    /// This node serves no epoch of the name.
    #[error("no epoch of {0} is served here")]
    UnknownName(String),

    /// The caller addressed an epoch that is not the current one. Nothing
    /// was proposed.
    #[error("{requested} is not the current epoch, {current} is")]
    EpochMismatch {
        /// The addressed paxos id.
        requested: String,
        /// The paxos id of the current epoch.
        current: String,
    },

    /// The operation belongs to another name.
    #[error("operation on {op} sent to {paxos_id}")]
    WrongName {
        /// The addressed paxos id.
        paxos_id: String,
        /// The name the operation changes.
        op: String,
    },

    /// The group refused the proposal.
    #[error(transparent)]
    Paxos(#[from] PaxosError),

    /// The operation could not be encoded.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A node of the name service.
pub struct NameServer {
    node_id: NodeId,
    /// Fresh for every start, so request ids never repeat across restarts.
    client_id: u64,
    next_request: AtomicU64,
    store: Arc<NameRecordStore>,
    manager: Arc<PaxosManager>,
}

impl NameServer {
    /// Recover the names logged under `config.log_folder` and start serving.
    pub async fn start(
        node_id: NodeId,
        nodes: impl IntoIterator<Item = NodeId>,
        config: PaxosConfig,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(NameRecordStore::new(node_id));
        let manager = PaxosManager::start(node_id, nodes, config, transport, store.clone()).await?;
        info!("name server {} started", node_id);
        Ok(Arc::new(Self {
            node_id,
            client_id: rand::random(),
            next_request: AtomicU64::new(0),
            store,
            manager,
        }))
    }

    /// Start serving `name` in `epoch` among `members`.
    ///
    /// The new epoch starts from the records of the epoch it supersedes on
    /// this node, so the previous epoch should have decided its stop request
    /// (see [`NameServer::stop_name`]) before any member rolls over.
    /// Returns false if `epoch` is not newer than the current one or the
    /// group could not be created.
    pub fn add_name(&self, name: &str, epoch: u64, members: &[NodeId]) -> bool {
        let paxos_id = versioned(name, epoch);
        let previous = self.manager.current_paxos_id(&paxos_id);
        if let Some(current) = previous.as_deref().and_then(epoch_of) {
            if current >= epoch {
                warn!("{}\tnot newer than the current epoch {}", paxos_id, current);
                return false;
            }
        }

        let seed = match previous.as_deref().and_then(|id| self.store.table(id)) {
            Some(table) => {
                if !table.is_frozen() {
                    warn!("{}\tsupersedes an epoch that was not stopped", paxos_id);
                }
                table.next_epoch()
            }
            None => NameTable::default(),
        };
        let state = match seed.to_state() {
            Ok(s) => s,
            Err(e) => {
                error!("{}\tcannot encode initial records: {:#}", paxos_id, e);
                return false;
            }
        };

        let seeded = self.store.seed(&paxos_id, seed);
        if !self.manager.create_paxos_instance(
            &paxos_id,
            members.iter().copied(),
            &state,
            Duration::ZERO,
        ) {
            if seeded {
                self.store.remove(&paxos_id);
            }
            return false;
        }
        if let Some(previous) = previous {
            self.store.remove(&previous);
        }
        true
    }

    fn current(&self, paxos_id: &str) -> Result<String, NameError> {
        let current = self
            .manager
            .current_paxos_id(paxos_id)
            .ok_or_else(|| NameError::UnknownName(paxos_key(paxos_id).to_owned()))?;
        if current != paxos_id {
            return Err(NameError::EpochMismatch {
                requested: paxos_id.to_owned(),
                current,
            });
        }
        Ok(current)
    }

    fn request(&self, value: String) -> RequestPacket {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        RequestPacket::new(self.client_id, request_id, value)
    }

    /// Propose `op` to the group `paxos_id` (`<name>-<epoch>`), which must be
    /// the current epoch of the name. Returns the id of the group that took
    /// the request; the change is applied once it is decided.
    pub fn update(&self, paxos_id: &str, op: Operation) -> Result<String, NameError> {
        if op.name() != paxos_key(paxos_id) {
            return Err(NameError::WrongName {
                paxos_id: paxos_id.to_owned(),
                op: op.name().to_owned(),
            });
        }
        self.current(paxos_id)?;
        let request = self.request(op.encode()?);
        match self.manager.propose(paxos_id, request)? {
            Some(taken) => {
                if taken != paxos_id {
                    warn!("{}\trolled over to {} while proposing", paxos_id, taken);
                }
                Ok(taken)
            }
            None => Err(NameError::UnknownName(paxos_key(paxos_id).to_owned())),
        }
    }

    /// Propose the stop request that ends epoch `paxos_id`. Its records
    /// freeze once the stop is decided.
    pub fn stop_name(&self, paxos_id: &str) -> Result<String, NameError> {
        self.current(paxos_id)?;
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let request = RequestPacket::stop_request(self.client_id, request_id);
        self.manager
            .propose(paxos_id, request)?
            .ok_or_else(|| NameError::UnknownName(paxos_key(paxos_id).to_owned()))
    }

    /// Local values of `key` in epoch `paxos_id`.
    pub fn lookup(&self, paxos_id: &str, key: &str) -> Result<Option<Vec<String>>, NameError> {
        let current = self.current(paxos_id)?;
        Ok(self.store.lookup(&current, key))
    }

    /// Current epoch of `name`.
    pub fn current_epoch(&self, name: &str) -> Option<u64> {
        self.manager
            .current_paxos_id(&versioned(name, 0))
            .as_deref()
            .and_then(epoch_of)
    }

    /// Id of this node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Records of every name served here.
    pub fn store(&self) -> &Arc<NameRecordStore> {
        &self.store
    }

    /// The paxos manager of this node.
    pub fn manager(&self) -> &Arc<PaxosManager> {
        &self.manager
    }

    /// Stop the paxos manager.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

#[async_trait]
impl Server for NameServer {
    async fn handle(&self, packet: Value) -> anyhow::Result<()> {
        self.manager.handle_incoming_packet(packet).await
    }
}
