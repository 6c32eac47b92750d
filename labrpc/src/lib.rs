//! In-process packet transport between numbered nodes.
//!
//! Every node owns an inbox of JSON frames; a single router task moves frames
//! between inboxes and applies the faults configured through a
//! [`NetworkController`].

pub mod client;
pub mod network;
pub mod server;

pub use anyhow;
pub use async_trait::async_trait;
pub use futures;
pub use log;
pub use rand;
pub use serde;
pub use serde_json;
pub use tokio;

pub use client::{Client, Transport};
pub use network::{Network, NetworkController, NodeId, Registrar};
pub use server::{serve, Server};
