use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use log::{info, trace, warn};
use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::client::Client;

/// Identifier of a node attached to the network.
pub type NodeId = u32;

const ROUTER_CAPACITY: usize = 1024;
const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct NetworkPackage {
    pub from: NodeId,
    pub to: NodeId,
    pub data: String,
}

type Filter = Box<dyn Fn(&NetworkPackage) -> bool + Send + Sync>;

#[derive(Default)]
struct Faults {
    disconnected: HashSet<NodeId>,
    loss_rate: f64,
    filter: Option<Filter>,
}

impl Faults {
    fn drops(&self, p: &NetworkPackage) -> bool {
        if self.disconnected.contains(&p.from) || self.disconnected.contains(&p.to) {
            return true;
        }
        if let Some(f) = &self.filter {
            if f(p) {
                return true;
            }
        }
        self.loss_rate > 0.0 && rand::thread_rng().gen_range(0.0..1.0) < self.loss_rate
    }
}

pub struct Network {
    pub tx: Sender<NetworkPackage>,
    rx: Receiver<NetworkPackage>,
    pub nodes: Arc<Mutex<HashMap<NodeId, Sender<String>>>>,
    faults: Arc<Mutex<Faults>>,
}

/// Attaches nodes, also after the network has been moved into its router
/// task.
#[derive(Clone)]
pub struct Registrar {
    tx: Sender<NetworkPackage>,
    nodes: Arc<Mutex<HashMap<NodeId, Sender<String>>>>,
}

impl Registrar {
    /// Attach node `id`, returning its sending handle and its inbox. A node
    /// attached again loses its old inbox.
    pub fn register(&self, id: NodeId) -> (Client, Receiver<String>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if self.nodes.lock().unwrap().insert(id, tx).is_some() {
            info!("node {} re-registered, old inbox dropped", id);
        }
        (Client::new(id, self.tx.clone()), rx)
    }
}

/// Fault injection handle, usable after the network has been moved into its
/// router task.
#[derive(Clone)]
pub struct NetworkController {
    faults: Arc<Mutex<Faults>>,
}

impl Network {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(ROUTER_CAPACITY);
        Self {
            tx,
            rx,
            nodes: Arc::new(Mutex::new(HashMap::default())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Attach node `id`, returning its sending handle and its inbox.
    pub fn register(&self, id: NodeId) -> (Client, Receiver<String>) {
        self.registrar().register(id)
    }

    pub fn registrar(&self) -> Registrar {
        Registrar {
            tx: self.tx.clone(),
            nodes: self.nodes.clone(),
        }
    }

    pub fn controller(&self) -> NetworkController {
        NetworkController {
            faults: self.faults.clone(),
        }
    }

    pub async fn run(mut self) {
        // `self.tx` is kept alive by this loop, so recv never yields None.
        while let Some(p) = self.rx.recv().await {
            if self.faults.lock().unwrap().drops(&p) {
                trace!("dropped {} -> {}", p.from, p.to);
                continue;
            }
            let node = {
                let x = self.nodes.lock().unwrap();
                x.get(&p.to).cloned()
            };

            if let Some(x) = node {
                match x.try_send(p.data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("inbox of node {} full, dropped", p.to),
                    Err(TrySendError::Closed(_)) => trace!("node {} has shut down", p.to),
                }
            } else {
                warn!("node {} not found", p.to);
            }
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkController {
    /// Drop every packet sent by or addressed to `id`.
    pub fn disconnect(&self, id: NodeId) {
        self.faults.lock().unwrap().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.faults.lock().unwrap().disconnected.remove(&id);
    }

    /// Drop each packet independently with probability `p`.
    pub fn set_loss_rate(&self, p: f64) {
        self.faults.lock().unwrap().loss_rate = p;
    }

    /// Drop every packet for which `f` returns true.
    pub fn set_filter<F>(&self, f: F)
    where
        F: Fn(&NetworkPackage) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().unwrap().filter = Some(Box::new(f));
    }

    pub fn clear_filter(&self) {
        self.faults.lock().unwrap().filter = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Transport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_route_and_exclude() {
        let net = Network::new();
        let (c0, mut rx0) = net.register(0);
        let (_c1, mut rx1) = net.register(1);
        let (_c2, mut rx2) = net.register(2);
        tokio::spawn(net.run());

        c0.send(&[0, 1, 2], json!({"v": 1}), Some(0)).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(got, r#"{"v":1}"#);
        assert!(timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().is_some());
        assert!(timeout(Duration::from_millis(100), rx0.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_register_after_start() {
        let net = Network::new();
        let registrar = net.registrar();
        let (c0, _rx0) = net.register(0);
        let (_c1, mut old) = net.register(1);
        tokio::spawn(net.run());

        let (_c1, mut rx1) = registrar.register(1);
        c0.send(&[1], json!("hi"), None).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(got, r#""hi""#);
        // The replaced inbox is closed.
        assert!(old.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_and_filter() {
        let net = Network::new();
        let ctl = net.controller();
        let (c0, _rx0) = net.register(0);
        let (_c1, mut rx1) = net.register(1);
        tokio::spawn(net.run());

        ctl.disconnect(0);
        c0.send(&[1], json!("lost"), None).await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());

        ctl.reconnect(0);
        ctl.set_filter(|p| p.data.contains("drop"));
        c0.send(&[1], json!("drop me"), None).await.unwrap();
        c0.send(&[1], json!("keep me"), None).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(got, r#""keep me""#);

        ctl.clear_filter();
        ctl.set_loss_rate(1.0);
        c0.send(&[1], json!("never"), None).await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());
    }
}
