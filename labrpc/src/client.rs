use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::trace;
use serde_json::Value;
use tokio::sync::mpsc::Sender;

use crate::network::{NetworkPackage, NodeId};

/// Send primitive consumed by the consensus layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `packet` to every node in `to` except `exclude`.
    async fn send(&self, to: &[NodeId], packet: Value, exclude: Option<NodeId>) -> Result<()>;
}

/// A node's handle on the [`Network`](crate::Network).
#[derive(Debug, Clone)]
pub struct Client {
    id: NodeId,
    tx: Sender<NetworkPackage>,
}

impl Client {
    pub(crate) fn new(id: NodeId, tx: Sender<NetworkPackage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[async_trait]
impl Transport for Client {
    async fn send(&self, to: &[NodeId], packet: Value, exclude: Option<NodeId>) -> Result<()> {
        let data = serde_json::to_string(&packet)?;
        for &dest in to.iter().filter(|&&d| Some(d) != exclude) {
            trace!("{} -> {}: {}", self.id, dest, &data);
            self.tx
                .send(NetworkPackage {
                    from: self.id,
                    to: dest,
                    data: data.clone(),
                })
                .await
                .map_err(|_| anyhow!("network router has stopped"))?;
        }
        Ok(())
    }
}
