use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, error, info, trace, warn};
use paxos::{paxos_key, NodeId, PaxosInterface, RequestPacket};

use crate::record::{NameTable, Operation};

/// Name tables of every paxos group on a node, keyed by full paxos id.
pub struct NameRecordStore {
    node_id: NodeId,
    tables: Mutex<HashMap<String, NameTable>>,
}

impl NameRecordStore {
    /// An empty store on node `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Values of `key` in the table of `paxos_id`.
    pub fn lookup(&self, paxos_id: &str, key: &str) -> Option<Vec<String>> {
        let tables = self.tables.lock().unwrap();
        tables.get(paxos_id)?.get(key).map(<[String]>::to_vec)
    }

    /// A copy of the table of `paxos_id`.
    pub fn table(&self, paxos_id: &str) -> Option<NameTable> {
        self.tables.lock().unwrap().get(paxos_id).cloned()
    }

    /// Install `table` for a group about to be created. Returns false, and
    /// keeps the present table, if the group already has one.
    pub fn seed(&self, paxos_id: &str, table: NameTable) -> bool {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(paxos_id) {
            return false;
        }
        tables.insert(paxos_id.to_owned(), table);
        true
    }

    /// Drop the table of `paxos_id`.
    pub fn remove(&self, paxos_id: &str) -> Option<NameTable> {
        self.tables.lock().unwrap().remove(paxos_id)
    }

    /// Whether `paxos_id` decided its stop request here.
    pub fn is_frozen(&self, paxos_id: &str) -> bool {
        self.tables
            .lock()
            .unwrap()
            .get(paxos_id)
            .is_some_and(NameTable::is_frozen)
    }
}

impl PaxosInterface for NameRecordStore {
    fn handle_paxos_decision(&self, paxos_id: &str, request: &RequestPacket, recovery: bool) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(paxos_id.to_owned()).or_default();
        if request.stop {
            info!("{}\trecords frozen at node {}", paxos_id, self.node_id);
            table.freeze();
            return;
        }
        if table.is_frozen() {
            warn!("{}\tignoring a decision after the stop request", paxos_id);
            return;
        }
        let op = match Operation::decode(&request.value) {
            Ok(op) => op,
            Err(e) => {
                warn!(
                    "{}\tignoring undecodable request {}:{}: {}",
                    paxos_id, request.client_id, request.request_id, e
                );
                return;
            }
        };
        if op.name() != paxos_key(paxos_id) {
            warn!("{}\tignoring operation on name {}", paxos_id, op.name());
            return;
        }
        if table.apply(request.client_id, request.request_id, &op) {
            trace!("{}\tapplied {:?} (recovery: {})", paxos_id, op, recovery);
        } else {
            debug!(
                "{}\tduplicate request {}:{}",
                paxos_id, request.client_id, request.request_id
            );
        }
    }

    fn get_state(&self, paxos_id: &str) -> Option<String> {
        let tables = self.tables.lock().unwrap();
        match tables.get(paxos_id)?.to_state() {
            Ok(state) => Some(state),
            Err(e) => {
                error!("{}\tcannot encode records: {:#}", paxos_id, e);
                None
            }
        }
    }

    fn update_state(&self, paxos_id: &str, state: &str) -> bool {
        match NameTable::from_state(state) {
            Ok(table) => {
                self.tables
                    .lock()
                    .unwrap()
                    .insert(paxos_id.to_owned(), table);
                true
            }
            Err(e) => {
                error!("{}\tcannot decode records: {:#}", paxos_id, e);
                false
            }
        }
    }

    fn handle_failure_message(&self, node: NodeId, up: bool) {
        info!(
            "node {} sees node {} {}",
            self.node_id,
            node,
            if up { "up" } else { "down" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxos::{Ballot, Checkpoint, PaxosLogger, ProposalTracker, Services};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn request(request_id: u64, op: &Operation) -> RequestPacket {
        RequestPacket::new(1, request_id, op.encode().unwrap())
    }

    fn add(name: &str, value: &str) -> Operation {
        Operation::Add {
            name: name.into(),
            key: "A".into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_decisions_change_records() {
        let store = NameRecordStore::new(0);
        store.handle_paxos_decision("alice-1", &request(0, &add("alice", "x")), false);
        store.handle_paxos_decision("alice-1", &request(0, &add("alice", "x")), false);
        store.handle_paxos_decision("alice-1", &request(1, &add("bob", "y")), false);
        store.handle_paxos_decision("alice-1", &RequestPacket::new(1, 2, "garbage"), false);
        assert_eq!(store.lookup("alice-1", "A"), Some(vec!["x".to_string()]));

        store.handle_paxos_decision("alice-1", &RequestPacket::stop_request(1, 3), false);
        assert!(store.is_frozen("alice-1"));
        store.handle_paxos_decision("alice-1", &request(4, &add("alice", "z")), false);
        assert_eq!(store.lookup("alice-1", "A"), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_checkpoint_state() {
        let store = NameRecordStore::new(0);
        assert!(store.get_state("alice-1").is_none());
        store.handle_paxos_decision("alice-1", &request(0, &add("alice", "x")), false);
        let state = store.get_state("alice-1").unwrap();

        let other = NameRecordStore::new(1);
        assert!(other.update_state("alice-1", &state));
        assert_eq!(other.table("alice-1"), store.table("alice-1"));
        assert!(!other.update_state("alice-1", "{"));
        assert_eq!(other.lookup("alice-1", "A"), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_seed_keeps_present_table() {
        let store = NameRecordStore::new(0);
        let mut seed = NameTable::default();
        seed.apply(9, 9, &add("alice", "seeded"));
        assert!(store.seed("alice-1", seed.clone()));
        assert!(!store.seed("alice-1", NameTable::default()));
        assert_eq!(store.table("alice-1"), Some(seed));
        assert!(store.remove("alice-1").is_some());
        assert!(store.table("alice-1").is_none());
    }

    #[test]
    fn test_recovered_from_durable_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(PaxosLogger::open(dir.path(), false).unwrap());
        let members: BTreeSet<NodeId> = (0..3).collect();

        let mut seed = NameTable::default();
        seed.apply(9, 9, &add("alice", "seeded"));
        let checkpoint = Checkpoint {
            paxos_id: "alice-1".into(),
            ballot: Ballot::new(0, 0),
            slot: 0,
            state: seed.to_state().unwrap(),
        };
        logger.log_start("alice-1", &members, &checkpoint).unwrap();
        logger
            .log_decision("alice-1", 0, &request(0, &add("alice", "x")))
            .unwrap();
        logger
            .log_decision("alice-1", 1, &request(0, &add("alice", "x")))
            .unwrap();

        let store = Arc::new(NameRecordStore::new(2));
        let services = Services {
            node_id: 2,
            logger: logger.clone(),
            app: store.clone(),
            tracker: Arc::new(ProposalTracker::new()),
        };
        let recovered = logger.recover(&services).unwrap();
        assert_eq!(recovered["alice"].next_execute(), 2);
        assert_eq!(
            store.lookup("alice-1", "A"),
            Some(vec!["seeded".to_string(), "x".to_string()])
        );
    }
}
