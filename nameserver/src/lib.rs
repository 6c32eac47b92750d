#![deny(missing_docs)]
#![deny(clippy::all)]
//! Replicated name records on top of multi-instance paxos.
//!
//! Every name is served by its own paxos group whose id is `<name>-<epoch>`.
//! Changes to a name's records are proposed to that group and applied by
//! every member in the decided order.

/// Name records and the operations on them.
pub mod record;

/// The paxos application holding the records of every name.
pub mod store;

/// Node-level entry point.
pub mod server;


pub use record::{NameTable, Operation};
pub use server::{versioned, NameError, NameServer};
pub use store::NameRecordStore;
