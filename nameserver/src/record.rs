use std::collections::{BTreeMap, BTreeSet};

use labrpc::anyhow::Result;
use serde::{Deserialize, Serialize};

/// A change to one key of a name, carried as JSON in the value of a request.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Append `value` to the values of `key`.
    Add {
        name: String,
        key: String,
        value: String,
    },
    /// Make `value` the only value of `key`.
    Replace {
        name: String,
        key: String,
        value: String,
    },
    /// Drop every copy of `value` from `key`, and the key once it is empty.
    Remove {
        name: String,
        key: String,
        value: String,
    },
}

impl Operation {
    /// Name whose records the operation changes.
    pub fn name(&self) -> &str {
        match self {
            Operation::Add { name, .. }
            | Operation::Replace { name, .. }
            | Operation::Remove { name, .. } => name,
        }
    }

    /// Encode as the value of a request.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the value of a decided request.
    pub fn decode(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// Records of one name in one epoch.
///
/// The table is also the checkpoint state of its paxos group, so it carries
/// the ids of the requests already applied: a retried request decided in a
/// later slot must not be applied twice, even after a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTable {
    records: BTreeMap<String, Vec<String>>,
    /// `(client_id, request_id)` of every applied request.
    applied: BTreeSet<(u64, u64)>,
    /// Set once the epoch decided its stop request.
    #[serde(default)]
    frozen: bool,
}

impl NameTable {
    /// Apply `op` unless request `(client_id, request_id)` was applied before.
    /// Returns whether the table changed.
    pub fn apply(&mut self, client_id: u64, request_id: u64, op: &Operation) -> bool {
        if !self.applied.insert((client_id, request_id)) {
            return false;
        }
        match op {
            Operation::Add { key, value, .. } => {
                self.records
                    .entry(key.clone())
                    .or_default()
                    .push(value.clone());
            }
            Operation::Replace { key, value, .. } => {
                self.records.insert(key.clone(), vec![value.clone()]);
            }
            Operation::Remove { key, value, .. } => {
                if let Some(values) = self.records.get_mut(key) {
                    values.retain(|v| v != value);
                    if values.is_empty() {
                        self.records.remove(key);
                    }
                }
            }
        }
        true
    }

    /// Values of `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.records.get(key).map(Vec::as_slice)
    }

    /// Every key with its values.
    pub fn records(&self) -> &BTreeMap<String, Vec<String>> {
        &self.records
    }

    /// Whether the request was applied already.
    pub fn has_applied(&self, client_id: u64, request_id: u64) -> bool {
        self.applied.contains(&(client_id, request_id))
    }

    /// Refuse further operations; the epoch is over.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the epoch decided its stop request.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Starting table of the epoch that follows this one.
    pub fn next_epoch(&self) -> Self {
        Self {
            frozen: false,
            ..self.clone()
        }
    }

    /// Parse a checkpoint. The empty state is the empty table.
    pub fn from_state(state: &str) -> Result<Self> {
        if state.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(state)?)
    }

    /// Encode as a checkpoint.
    pub fn to_state(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
