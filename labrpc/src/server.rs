use std::sync::Arc;

use anyhow::Result;
use log::{error, trace, warn};
use serde_json::Value;
use tokio::sync::mpsc::Receiver;

/// Receiving side of a node.
#[async_trait::async_trait]
pub trait Server: Send + Sync + 'static {
    async fn handle(&self, packet: Value) -> Result<()>;
}

/// Feed every frame of `inbox` to `server` until the inbox closes.
///
/// Malformed frames and handler failures are logged and dropped; they never
/// end the loop.
pub async fn serve<S: Server + ?Sized>(server: Arc<S>, mut inbox: Receiver<String>) {
    while let Some(data) = inbox.recv().await {
        trace!("handle recv: {}", &data);
        let packet: Value = match serde_json::from_str(&data) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                continue;
            }
        };
        if let Err(e) = server.handle(packet).await {
            error!("handler failed: {}", e);
        }
    }
}
