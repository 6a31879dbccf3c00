//! In-process network for running whole clusters inside one process.
//!
//! Every node gets the same channel contract as with [`crate::transport`]:
//! it reads [`Inbound`] and writes [`Outbound`]. Messages to or from an
//! isolated node are silently lost; with latency configured, each message is
//! delayed independently, so delivery order is not preserved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::message::{ClientId, ClientReply, ClientWrite, Inbound, Message, NodeId, Outbound};
use crate::transport::Latency;

#[derive(Default)]
struct Links {
    nodes: HashMap<NodeId, UnboundedSender<Inbound>>,
    isolated: HashSet<NodeId>,
    clients: HashMap<ClientId, oneshot::Sender<ClientReply>>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    links: Arc<Mutex<Links>>,
    latency: Arc<Latency>,
    next_client: Arc<AtomicU64>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches node `id` and starts routing what it sends.
    pub fn attach(
        &self,
        id: NodeId,
        inbound: UnboundedSender<Inbound>,
        mut outbound: UnboundedReceiver<Outbound>,
    ) -> JoinHandle<()> {
        self.links().nodes.insert(id, inbound);
        let network = self.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::NodeReply(msg) => network.route(msg),
                    Outbound::ClientReply(reply) => {
                        let waiting = network.links().clients.remove(&reply.client);
                        if let Some(reply_to) = waiting {
                            let _ = reply_to.send(reply);
                        }
                    }
                }
            }
            debug!(node = id, "router stopped");
        })
    }

    fn route(&self, msg: Message) {
        for &to in msg.to.iter().filter(|&&to| to != msg.from) {
            let target = {
                let links = self.links();
                if links.isolated.contains(&msg.from) || links.isolated.contains(&to) {
                    continue;
                }
                links.nodes.get(&to).cloned()
            };
            let Some(target) = target else {
                continue;
            };

            let delay = self.latency.sample();
            let inbound = Inbound::FromNode(msg.clone());
            if delay.is_zero() {
                let _ = target.send(inbound);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = target.send(inbound);
                });
            }
        }
    }

    /// Delivers `msg` to node `to` as if it came off the wire.
    pub fn inject(&self, to: NodeId, msg: Message) -> Result<()> {
        let target = self
            .links()
            .nodes
            .get(&to)
            .cloned()
            .with_context(|| format!("node {to} is not attached"))?;
        target
            .send(Inbound::FromNode(msg))
            .ok()
            .with_context(|| format!("node {to} has stopped"))
    }

    /// Sends a client write to node `to` and waits for the answer.
    pub async fn submit(&self, to: NodeId, sync: bool, payload: impl Into<String>) -> Result<ClientReply> {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        let target = {
            let mut links = self.links();
            links.clients.insert(client, reply_tx);
            links.nodes.get(&to).cloned()
        }
        .with_context(|| format!("node {to} is not attached"))?;

        let write = ClientWrite {
            client,
            sync,
            payload: payload.into(),
        };
        target
            .send(Inbound::FromClient(write))
            .ok()
            .with_context(|| format!("node {to} has stopped"))?;
        reply_rx
            .await
            .with_context(|| format!("node {to} dropped client {client}"))
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.links().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.links().isolated.remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.links().isolated.contains(&id)
    }

    pub fn latency(&self) -> &Latency {
        &self.latency
    }
}
