//! Wiring a node together with its collaborators.
//!
//! [`spawn_node`] starts the four pieces that make up a running member:
//!
//! - the **node loop** task, which owns all consensus state;
//! - the **application** task, fed by the node loop;
//! - the **storage** thread, which persists metadata and committed entries;
//! - whatever **transport** the caller connected to the inbound/outbound ends.
//!
//! The caller keeps a [`NodeHandle`] for operator queries and shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::app::{spawn_application, AppRequest, Application, KvStore};
use crate::error::RaftError;
use crate::log::{LogKey, LogStore};
use crate::message::{ClientReply, Inbound, NodeId, Outbound};
use crate::meta::Meta;
use crate::network::LocalNetwork;
use crate::node::{Control, Node, NodeIo, NodeStatus};
use crate::role::RoleKind;
use crate::storage::{FileMedium, Medium, MemoryMedium, Storage};
use crate::transport::{Latency, TcpTransport, TransportConfig};

/// The node side of a transport.
pub struct TransportEnds {
    pub inbound: UnboundedReceiver<Inbound>,
    pub outbound: UnboundedSender<Outbound>,
}

/// Handle for talking to a running node loop.
pub struct NodeHandle {
    id: NodeId,
    control: UnboundedSender<Control>,
    log: Arc<LogStore>,
    task: JoinHandle<Result<(), RaftError>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's log; readable while the node runs.
    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Status(tx))
            .map_err(|_| anyhow!("node {} has stopped", self.id))?;
        rx.await.context("status response channel closed")
    }

    pub async fn describe(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Describe(tx))
            .map_err(|_| anyhow!("node {} has stopped", self.id))?;
        rx.await.context("describe response channel closed")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.control
            .send(Control::Shutdown)
            .map_err(|_| anyhow!("node {} has already stopped", self.id))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the node loop to end and returns how it ended.
    pub async fn join(self) -> Result<Result<(), RaftError>> {
        self.task.await.context("node task panicked")
    }
}

/// Loads persisted state and starts node, application and storage.
pub fn spawn_node<M, A>(storage: Storage<M>, app: A, ends: TransportEnds) -> Result<NodeHandle>
where
    M: Medium,
    A: Application,
{
    let recovered = storage.load()?;
    let meta = recovered.meta;
    let id = meta.id;
    let log = Arc::new(LogStore::hydrate(recovered.entries, meta.committed()));
    info!(
        node = id,
        term = meta.term,
        entries = log.len(),
        committed = %log.committed(),
        "starting node"
    );

    let (store_tx, store_rx) = unbounded_channel();
    let (app_tx, app_rx) = unbounded_channel();
    let (response_tx, response_rx) = unbounded_channel();
    let (control_tx, control_rx) = unbounded_channel();

    // Rebuild application state from the recovered log before anything new.
    for entry in log.snapshot() {
        app_tx
            .send(AppRequest::replicated(entry.payload))
            .map_err(|_| anyhow!("application channel closed during replay"))?;
    }

    storage.spawn(format!("raft-storage-{id}"), Arc::clone(&log), store_rx)?;
    spawn_application(app, app_rx, response_tx);

    let node = Node::new(
        meta,
        Arc::clone(&log),
        NodeIo {
            inbound: ends.inbound,
            outbound: ends.outbound,
            storage: store_tx,
            app_requests: app_tx,
            app_responses: response_rx,
            control: control_rx,
        },
    )?;
    let task = tokio::spawn(node.run());

    Ok(NodeHandle {
        id,
        control: control_tx,
        log,
        task,
    })
}

/// A node serving TCP peers and clients.
pub struct TcpNode {
    pub handle: NodeHandle,
    pub latency: Arc<Latency>,
    pub local_addr: SocketAddr,
}

/// Starts a node from its meta and log files, listening on TCP.
pub async fn start_tcp_node(
    meta_path: impl Into<PathBuf>,
    log_path: impl Into<PathBuf>,
    listen: Option<SocketAddr>,
    config: TransportConfig,
) -> Result<TcpNode> {
    let storage = Storage::new(FileMedium, meta_path, log_path);
    let meta = storage.load()?.meta;

    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (outbound_tx, outbound_rx) = unbounded_channel();
    let transport = TcpTransport::bind(&meta, listen, inbound_tx, config).await?;
    let local_addr = transport.local_addr()?;
    let latency = transport.latency();
    transport.spawn(outbound_rx);
    info!(node = meta.id, addr = %local_addr, "listening");

    let handle = spawn_node(
        storage,
        KvStore::new(),
        TransportEnds {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
    )?;
    Ok(TcpNode {
        handle,
        latency,
        local_addr,
    })
}

/// A whole cluster on a [`LocalNetwork`], with in-memory storage.
pub struct LocalCluster {
    network: LocalNetwork,
    nodes: Vec<NodeHandle>,
    media: Vec<MemoryMedium>,
}

impl LocalCluster {
    pub const META_FILE: &'static str = "meta.json";
    pub const LOG_FILE: &'static str = "log.txt";

    /// Starts `num` members; `configure` may adjust each member's metadata.
    pub fn start(num: u64, configure: impl Fn(&mut Meta)) -> Result<Self> {
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        let mut media = Vec::new();

        for id in 0..num {
            let mut meta = Meta::for_member(id, num);
            configure(&mut meta);
            let medium = MemoryMedium::new().with_file(Self::META_FILE, meta.to_json()?);

            let (inbound_tx, inbound_rx) = unbounded_channel();
            let (outbound_tx, outbound_rx) = unbounded_channel();
            network.attach(id, inbound_tx, outbound_rx);

            let storage = Storage::new(medium.clone(), Self::META_FILE, Self::LOG_FILE);
            let handle = spawn_node(
                storage,
                KvStore::new(),
                TransportEnds {
                    inbound: inbound_rx,
                    outbound: outbound_tx,
                },
            )?;
            nodes.push(handle);
            media.push(medium);
        }

        Ok(Self {
            network,
            nodes,
            media,
        })
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn node(&self, id: NodeId) -> &NodeHandle {
        &self.nodes[id as usize]
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// In-memory files of node `id`.
    pub fn medium(&self, id: NodeId) -> &MemoryMedium {
        &self.media[id as usize]
    }

    pub async fn write(&self, to: NodeId, sync: bool, payload: &str) -> Result<ClientReply> {
        self.network.submit(to, sync, payload).await
    }

    /// Status of every reachable, running node.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for node in &self.nodes {
            if self.network.is_isolated(node.id()) {
                continue;
            }
            if let Ok(status) = node.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Waits until the connected nodes agree on exactly one leader in the
    /// highest term any of them has seen.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let start = Instant::now();
        loop {
            let statuses = self.statuses().await;
            let top = statuses.iter().map(|s| s.term).max().unwrap_or_default();
            let leaders: Vec<&NodeStatus> = statuses
                .iter()
                .filter(|s| s.role == RoleKind::Leader && s.term == top)
                .collect();
            let settled = statuses
                .iter()
                .filter(|s| s.role != RoleKind::Leader)
                .all(|s| s.role == RoleKind::Follower && s.term == top);
            if leaders.len() == 1 && settled {
                return Ok(leaders[0].id);
            }
            if start.elapsed() > timeout {
                anyhow::bail!("timeout waiting for a single leader: {statuses:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits until every node in `ids` has committed at least `key`.
    pub async fn wait_for_commit(
        &self,
        ids: &[NodeId],
        key: LogKey,
        timeout: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            if ids.iter().all(|&id| self.node(id).log().committed() >= key) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                anyhow::bail!("timeout waiting for {ids:?} to commit {key}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.shutdown();
        }
    }
}
