//! TCP transport: one JSON [`Envelope`] per line.
//!
//! Peers and clients share the node's listening address. Outbound peer
//! traffic goes through a bounded queue per peer, drained by one writer task
//! that owns a persistent connection and reconnects lazily. Delivery is
//! best-effort: a full queue or a broken connection drops the message and the
//! protocol's retries take it from there.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{
    read_message, write_message, ClientId, ClientReply, ClientWrite, Envelope, Inbound, Message,
    NodeId, Outbound,
};
use crate::meta::Meta;

/// Simulated network delay applied to outbound peer messages.
#[derive(Debug, Default)]
pub struct Latency {
    base_ms: AtomicU64,
    jitter_ms: AtomicU64,
}

impl Latency {
    pub fn set(&self, base_ms: u64, jitter_ms: u64) {
        self.base_ms.store(base_ms, Ordering::Relaxed);
        self.jitter_ms.store(jitter_ms, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.base_ms.load(Ordering::Relaxed),
            self.jitter_ms.load(Ordering::Relaxed),
        )
    }

    /// `base + rand(0..=jitter)`.
    pub fn sample(&self) -> Duration {
        let (base, jitter) = self.get();
        let extra = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        Duration::from_millis(base + extra)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of each per-peer send queue.
    pub peer_queue: usize,
    /// How long a client may wait for its reply.
    pub client_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peer_queue: 256,
            client_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TcpTransport {
    listener: TcpListener,
    peers: HashMap<NodeId, String>,
    state: Arc<TransportState>,
}

impl TcpTransport {
    /// Binds `listen`, or this node's entry in `meta.dns`.
    pub async fn bind(
        meta: &Meta,
        listen: Option<SocketAddr>,
        inbound: UnboundedSender<Inbound>,
        config: TransportConfig,
    ) -> Result<Self> {
        let addr = match listen {
            Some(addr) => addr.to_string(),
            None => meta
                .address(meta.id)
                .with_context(|| format!("no address for node {} in dns", meta.id))?
                .to_string(),
        };
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let peers = meta
            .members()
            .into_iter()
            .filter(|&id| id != meta.id)
            .filter_map(|id| meta.address(id).map(|addr| (id, addr.to_string())))
            .collect();

        Ok(Self {
            listener,
            peers,
            state: Arc::new(TransportState {
                id: meta.id,
                inbound,
                clients: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                latency: Arc::new(Latency::default()),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn latency(&self) -> Arc<Latency> {
        Arc::clone(&self.state.latency)
    }

    /// Starts accepting connections and routing `outbound`.
    pub fn spawn(self, outbound: UnboundedReceiver<Outbound>) -> JoinHandle<()> {
        let TcpTransport {
            listener,
            peers,
            state,
        } = self;

        let queues: HashMap<NodeId, mpsc::Sender<Message>> = peers
            .into_iter()
            .map(|(id, addr)| (id, spawn_peer_writer(id, addr, &state)))
            .collect();

        tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        tokio::spawn(route_outbound(outbound, queues, state))
    }
}

struct TransportState {
    id: NodeId,
    inbound: UnboundedSender<Inbound>,
    clients: Mutex<HashMap<ClientId, UnboundedSender<ClientReply>>>,
    next_client: AtomicU64,
    latency: Arc<Latency>,
    config: TransportConfig,
}

impl TransportState {
    fn register_client(&self, reply_to: UnboundedSender<ClientReply>) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.lock_clients().insert(id, reply_to);
        id
    }

    fn take_client(&self, id: ClientId) -> Option<UnboundedSender<ClientReply>> {
        self.lock_clients().remove(&id)
    }

    fn lock_clients(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ClientId, UnboundedSender<ClientReply>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn route_outbound(
    mut outbound: UnboundedReceiver<Outbound>,
    queues: HashMap<NodeId, mpsc::Sender<Message>>,
    state: Arc<TransportState>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::NodeReply(msg) => {
                for to in msg.to.iter().filter(|&&to| to != state.id) {
                    let Some(queue) = queues.get(to) else {
                        debug!(peer = to, "no address for peer, dropping");
                        continue;
                    };
                    match queue.try_send(msg.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(peer = to, kind = ?msg.kind, "peer queue full, dropping message")
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!(peer = to, "peer writer stopped, dropping message")
                        }
                    }
                }
            }
            Outbound::ClientReply(reply) => match state.take_client(reply.client) {
                Some(reply_to) => {
                    let _ = reply_to.send(reply);
                }
                None => debug!(client = reply.client, "client already gone"),
            },
        }
    }
    debug!(node = state.id, "outbound router stopped");
}

fn spawn_peer_writer(
    peer: NodeId,
    addr: String,
    state: &Arc<TransportState>,
) -> mpsc::Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.peer_queue);
    let latency = Arc::clone(&state.latency);
    tokio::spawn(async move {
        let mut conn: Option<OwnedWriteHalf> = None;
        while let Some(msg) = rx.recv().await {
            let delay = latency.sample();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if conn.is_none() {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        debug!(peer, %addr, "connected to peer");
                        let (_, writer) = stream.into_split();
                        conn = Some(writer);
                    }
                    Err(err) => {
                        debug!(peer, %addr, error = %err, "peer unreachable, dropping message");
                        continue;
                    }
                }
            }
            if let Some(writer) = conn.as_mut() {
                if let Err(err) = write_message(writer, &Envelope::Node(msg)).await {
                    debug!(peer, error = %err, "peer connection lost");
                    conn = None;
                }
            }
        }
    });
    tx
}

async fn accept_loop(listener: TcpListener, state: Arc<TransportState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state).await {
                        warn!(%peer, error = ?err, "connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<TransportState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ClientReply>();

    let reply_writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(err) = write_message(&mut writer, &Envelope::Reply(reply)).await {
                debug!(error = %err, "client went away before its reply");
                break;
            }
        }
    });

    let mut clients = Vec::new();
    let outcome = serve_connection(&mut reader, &state, &reply_tx, &mut clients).await;

    for id in clients {
        state.take_client(id);
    }
    drop(reply_tx);
    let _ = reply_writer.await;
    outcome
}

async fn serve_connection(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    state: &Arc<TransportState>,
    reply_tx: &UnboundedSender<ClientReply>,
    clients: &mut Vec<ClientId>,
) -> Result<()> {
    while let Some(envelope) = read_message::<_, Envelope>(reader).await? {
        match envelope {
            Envelope::Node(msg) => {
                if state.inbound.send(Inbound::FromNode(msg)).is_err() {
                    break;
                }
            }
            Envelope::Client { sync, payload } => {
                let client = state.register_client(reply_tx.clone());
                clients.push(client);
                debug!(client, sync, "client write received");
                spawn_client_timeout(client, state);
                let write = ClientWrite {
                    client,
                    sync,
                    payload,
                };
                if state.inbound.send(Inbound::FromClient(write)).is_err() {
                    break;
                }
            }
            Envelope::Reply(reply) => {
                warn!(client = reply.client, "unexpected reply envelope from remote");
            }
        }
    }
    Ok(())
}

fn spawn_client_timeout(client: ClientId, state: &Arc<TransportState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep(state.config.client_timeout).await;
        if let Some(reply_to) = state.take_client(client) {
            info!(client, "client request timed out");
            let _ = reply_to.send(ClientReply::failed(client, "request timed out"));
        }
    });
}

/// Sends one write to the node at `addr` and waits for its reply.
pub async fn request(addr: &str, sync: bool, payload: impl Into<String>) -> Result<ClientReply> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &Envelope::Client {
            sync,
            payload: payload.into(),
        },
    )
    .await?;

    match read_message::<_, Envelope>(&mut reader).await? {
        Some(Envelope::Reply(reply)) => Ok(reply),
        Some(other) => anyhow::bail!("unexpected envelope: {other:?}"),
        None => anyhow::bail!("connection closed before reply"),
    }
}
