//! The node event loop.
//!
//! One task owns all mutable node state: [`NodeContext`] plus the active
//! [`Role`]. It waits on the inbound channel, the application's replies, the
//! operator control channel and the single role timer, and handles one event
//! at a time to completion. Nothing inside a handler awaits, so every state
//! change is atomic with respect to other events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::app::{AppRequest, AppResponse};
use crate::error::{RaftError, Result};
use crate::log::{LogEntry, LogKey, LogStore, Term};
use crate::message::{ClientReply, Inbound, Message, MessageType, NodeId, Outbound, StoreOrder};
use crate::meta::Meta;
use crate::role::{dispatch, Follower, Role, RoleKind, Transition};
use crate::role::{Candidate, Leader};
use crate::sync::SyncLedger;

/// Single-shot deadline shared by all roles.
///
/// Re-arming replaces the previous deadline, so a timeout armed by a role the
/// node has since left can never fire.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn new(after: Duration) -> Self {
        Self {
            deadline: Instant::now() + after,
        }
    }

    pub fn reset(&mut self, after: Duration) {
        self.deadline = Instant::now() + after;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// State shared by every role, owned by the node loop.
pub struct NodeContext {
    pub meta: Meta,
    pub log: Arc<LogStore>,
    pub timer: Timer,
    pub sync: SyncLedger,
    members: Vec<NodeId>,
    quorum: usize,
    outbound: UnboundedSender<Outbound>,
    storage: UnboundedSender<StoreOrder>,
    app: UnboundedSender<AppRequest>,
}

impl NodeContext {
    pub fn id(&self) -> NodeId {
        self.meta.id
    }

    pub fn term(&self) -> Term {
        self.meta.term
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Fresh message stamped with this node's id and term.
    pub fn message(&self, kind: MessageType) -> Message {
        Message::new(kind, self.id(), self.term())
    }

    pub fn send(&self, msg: Message) {
        debug!(node = self.id(), kind = ?msg.kind, to = ?msg.to, term = msg.term, "send");
        if self.outbound.send(Outbound::NodeReply(msg)).is_err() {
            warn!(node = self.id(), "transport gone, dropping peer message");
        }
    }

    /// Sends `msg` to every member; the transport skips the sender.
    pub fn broadcast(&self, msg: Message) {
        let to = self.members.clone();
        self.send(msg.to(to));
    }

    pub fn reply_client(&self, reply: ClientReply) {
        if self.outbound.send(Outbound::ClientReply(reply)).is_err() {
            warn!(node = self.id(), "transport gone, dropping client reply");
        }
    }

    pub fn to_app(&self, request: AppRequest) -> Result<()> {
        self.app
            .send(request)
            .map_err(|_| RaftError::ChannelClosed("application"))
    }

    /// Orders storage to rewrite the metadata file.
    ///
    /// Failures are logged; the in-memory state stays authoritative.
    pub fn persist_meta(&self) {
        match self.meta.to_json() {
            Ok(json) => self.store(StoreOrder::Meta(json)),
            Err(err) => warn!(node = self.id(), error = %RaftError::from(err), "meta not persisted"),
        }
    }

    fn store(&self, order: StoreOrder) {
        if self.storage.send(order).is_err() {
            warn!(node = self.id(), error = %RaftError::ChannelClosed("storage"), "storage order dropped");
        }
    }

    /// Adopts a newer term seen on the wire.
    pub fn adopt_term(&mut self, term: Term) {
        info!(node = self.id(), from = self.term(), to = term, "adopting newer term");
        self.meta.term = term;
        self.persist_meta();
    }

    /// Advances the commit marker towards `key`.
    ///
    /// On progress: persists the marker, orders a flush of the newly
    /// committed range, answers clients bound to it, and returns the range.
    /// A commit that does not move the marker is a no-op.
    pub fn commit_through(&mut self, key: LogKey) -> Option<(LogKey, LogKey)> {
        let previous = self.log.commit(key);
        let committed = self.log.committed();
        if committed == previous {
            return None;
        }

        let start = match self.log.next(previous) {
            Ok(next) if !next.is_none() => next,
            _ => committed,
        };
        self.meta.set_committed(committed);
        self.persist_meta();
        self.store(StoreOrder::Flush {
            start,
            end: committed,
        });

        let keys = self.log.range_keys(start, committed);
        for reply in self.sync.resolve(keys) {
            self.reply_client(reply);
        }
        info!(node = self.id(), term = self.term(), from = %start, to = %committed, "committed");
        Some((start, committed))
    }

    /// Undoes truncated entries in the application, newest first, and fails
    /// any client waiting on them.
    pub fn roll_back(&mut self, removed: Vec<LogEntry>) -> Result<()> {
        for entry in removed.into_iter().rev() {
            if let Some(reply) = self.sync.fail(entry.key) {
                self.reply_client(reply);
            }
            self.to_app(AppRequest::undo(entry.payload))?;
        }
        Ok(())
    }
}

/// Snapshot of a node for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub last: LogKey,
    pub committed: LogKey,
    pub pending_clients: usize,
}

/// Operator requests served by the node loop between protocol events.
#[derive(Debug)]
pub enum Control {
    Status(oneshot::Sender<NodeStatus>),
    Describe(oneshot::Sender<String>),
    Shutdown,
}

/// Channel ends the node loop is wired with.
pub struct NodeIo {
    pub inbound: UnboundedReceiver<Inbound>,
    pub outbound: UnboundedSender<Outbound>,
    pub storage: UnboundedSender<StoreOrder>,
    pub app_requests: UnboundedSender<AppRequest>,
    pub app_responses: UnboundedReceiver<AppResponse>,
    pub control: UnboundedReceiver<Control>,
}

pub struct Node {
    ctx: NodeContext,
    role: Box<dyn Role>,
    inbound: UnboundedReceiver<Inbound>,
    app_responses: UnboundedReceiver<AppResponse>,
    control: UnboundedReceiver<Control>,
}

impl Node {
    /// Builds the node and enters the Follower role.
    pub fn new(meta: Meta, log: Arc<LogStore>, io: NodeIo) -> Result<Self> {
        let ctx = NodeContext {
            members: meta.members(),
            quorum: meta.quorum(),
            timer: Timer::new(meta.follower_timeout()),
            sync: SyncLedger::new(),
            meta,
            log,
            outbound: io.outbound,
            storage: io.storage,
            app: io.app_requests,
        };
        let role: Box<dyn Role> = Box::new(Follower::new(&ctx.meta));
        let mut node = Self {
            ctx,
            role,
            inbound: io.inbound,
            app_responses: io.app_responses,
            control: io.control,
        };
        let next = node.role.enter(&mut node.ctx)?;
        node.apply(next)?;
        Ok(node)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.ctx.id(),
            role: self.role.kind(),
            term: self.ctx.term(),
            last: self.ctx.log.last(),
            committed: self.ctx.log.committed(),
            pending_clients: self.ctx.sync.len(),
        }
    }

    pub fn describe(&self) -> String {
        let status = self.status();
        format!(
            "node {} | {} | term {} | last {} | committed {} | pending clients {}",
            status.id,
            self.role.describe(),
            status.term,
            status.last,
            status.committed,
            status.pending_clients
        )
    }

    /// Runs until shutdown or a fatal protocol violation.
    pub async fn run(mut self) -> Result<()> {
        info!(node = self.ctx.id(), term = self.ctx.term(), "node loop started");
        loop {
            let deadline = self.ctx.timer.deadline();
            let outcome = tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => break,
                },
                response = self.app_responses.recv() => match response {
                    Some(response) => self.handle_app_response(response),
                    None => break,
                },
                control = self.control.recv() => match control {
                    Some(Control::Status(reply)) => {
                        let _ = reply.send(self.status());
                        Ok(())
                    }
                    Some(Control::Describe(reply)) => {
                        let _ = reply.send(self.describe());
                        Ok(())
                    }
                    Some(Control::Shutdown) | None => break,
                },
                _ = sleep_until(deadline) => self.handle_timeout(),
            };

            if let Err(err) = outcome {
                if err.is_fatal() {
                    error!(node = self.ctx.id(), term = self.ctx.term(), error = %err, "fatal protocol violation, stopping");
                    return Err(err);
                }
                warn!(node = self.ctx.id(), error = %err, "event handling failed");
            }
        }
        info!(node = self.ctx.id(), "node loop stopped");
        Ok(())
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::FromNode(msg) => self.dispatch(msg),
            Inbound::FromClient(write) => {
                let client = write.client;
                match self.role.handle_client_write(write, &mut self.ctx) {
                    Ok(next) => self.apply(next),
                    Err(err) if err.is_fatal() => Err(err),
                    Err(err) => {
                        debug!(node = self.ctx.id(), client, error = %err, "client write refused");
                        self.ctx.reply_client(ClientReply::failed(
                            client,
                            format!("logic refuses to operate: {err}"),
                        ));
                        Ok(())
                    }
                }
            }
        }
    }

    /// Second half of the client pipeline: the application has run the write.
    pub fn handle_app_response(&mut self, response: AppResponse) -> Result<()> {
        let client = response.client;
        if !response.accepted {
            self.ctx.sync.forget(client);
            self.ctx
                .reply_client(ClientReply::failed(client, response.output));
            return Ok(());
        }
        if !response.need_sync {
            self.ctx.reply_client(ClientReply::ok(client, response.output));
            return Ok(());
        }
        if !self.ctx.sync.is_tracked(client) {
            warn!(node = self.ctx.id(), client, "sync response for an unknown client");
            return Ok(());
        }

        self.ctx.sync.record_output(client, response.output);
        match self.role.handle_client_sync(client, &mut self.ctx) {
            Ok(next) => self.apply(next),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(node = self.ctx.id(), client, error = %err, "client sync refused");
                self.ctx.sync.forget(client);
                self.ctx.reply_client(ClientReply::failed(
                    client,
                    "operated but logic refuses to sync, rollback later",
                ));
                Ok(())
            }
        }
    }

    pub fn handle_timeout(&mut self) -> Result<()> {
        debug!(node = self.ctx.id(), role = %self.role.kind(), "timer fired");
        let next = self.role.handle_timeout(&mut self.ctx)?;
        self.apply(next)
    }

    /// Term filtering in front of every role handler.
    fn dispatch(&mut self, msg: Message) -> Result<()> {
        if msg.from == self.ctx.id() || msg.term < self.ctx.term() {
            debug!(node = self.ctx.id(), kind = ?msg.kind, from = msg.from, term = msg.term, "dropping stale message");
            return Ok(());
        }
        if msg.term > self.ctx.term() {
            self.ctx.adopt_term(msg.term);
            return self.apply(Transition::Follower { replay: Some(msg) });
        }

        debug!(node = self.ctx.id(), kind = ?msg.kind, from = msg.from, term = msg.term, "handling message");
        let next = dispatch(self.role.as_mut(), msg, &mut self.ctx)?;
        self.apply(next)
    }

    fn apply(&mut self, transition: Transition) -> Result<()> {
        let (role, replay): (Box<dyn Role>, Option<Message>) = match transition {
            Transition::Stay => return Ok(()),
            Transition::Follower { replay } => (Box::new(Follower::new(&self.ctx.meta)), replay),
            Transition::Candidate => (Box::new(Candidate::new()), None),
            Transition::Leader => (Box::new(Leader::new()), None),
        };
        info!(
            node = self.ctx.id(),
            term = self.ctx.term(),
            from = %self.role.kind(),
            to = %role.kind(),
            "role switch"
        );
        self.role = role;
        let next = self.role.enter(&mut self.ctx)?;
        self.apply(next)?;

        match replay {
            Some(msg) => self.dispatch(msg),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppAction;
    use crate::error::{ClientRefusal, Fatal};
    use crate::message::ClientWrite;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver as Rx};

    struct Probe {
        outbound: Rx<Outbound>,
        storage: Rx<StoreOrder>,
        app: Rx<AppRequest>,
        _inbound: UnboundedSender<Inbound>,
        _responses: UnboundedSender<AppResponse>,
        _control: UnboundedSender<Control>,
    }

    impl Probe {
        fn messages(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(item) = self.outbound.try_recv() {
                if let Outbound::NodeReply(msg) = item {
                    out.push(msg);
                }
            }
            out
        }

        fn replies(&mut self) -> Vec<ClientReply> {
            let mut out = Vec::new();
            while let Ok(item) = self.outbound.try_recv() {
                if let Outbound::ClientReply(reply) = item {
                    out.push(reply);
                }
            }
            out
        }

        fn orders(&mut self) -> Vec<StoreOrder> {
            std::iter::from_fn(|| self.storage.try_recv().ok()).collect()
        }

        fn app_requests(&mut self) -> Vec<AppRequest> {
            std::iter::from_fn(|| self.app.try_recv().ok()).collect()
        }
    }

    fn key(term: Term, index: i64) -> LogKey {
        LogKey::new(term, index)
    }

    fn node_with(id: NodeId, num: u64, term: Term, keys: &[(Term, i64)]) -> (Node, Probe) {
        let mut meta = Meta::for_member(id, num);
        meta.term = term;
        let log = LogStore::new();
        for &(t, i) in keys {
            log.append(LogEntry::new(key(t, i), format!("set k{t}{i} v")));
        }

        let (inbound_tx, inbound) = unbounded_channel();
        let (outbound, outbound_rx) = unbounded_channel();
        let (storage, storage_rx) = unbounded_channel();
        let (app_requests, app_rx) = unbounded_channel();
        let (responses_tx, app_responses) = unbounded_channel();
        let (control_tx, control) = unbounded_channel();
        let io = NodeIo {
            inbound,
            outbound,
            storage,
            app_requests,
            app_responses,
            control,
        };
        let node = Node::new(meta, Arc::new(log), io).expect("node starts");
        let probe = Probe {
            outbound: outbound_rx,
            storage: storage_rx,
            app: app_rx,
            _inbound: inbound_tx,
            _responses: responses_tx,
            _control: control_tx,
        };
        (node, probe)
    }

    fn leader_with(num: u64, term: Term, keys: &[(Term, i64)]) -> (Node, Probe) {
        let (mut node, mut probe) = node_with(0, num, term, keys);
        node.apply(Transition::Leader).expect("become leader");
        probe.messages();
        (node, probe)
    }

    fn from(kind: MessageType, from: NodeId, term: Term) -> Inbound {
        Inbound::FromNode(Message::new(kind, from, term))
    }

    fn reply(from: NodeId, term: Term, agree: bool, last: LogKey, second: LogKey) -> Inbound {
        Inbound::FromNode(
            Message::new(MessageType::AppendLogReply, from, term)
                .agree(agree)
                .keys(last, second),
        )
    }

    #[test]
    fn stale_and_self_messages_are_dropped() {
        let (mut node, mut probe) = node_with(1, 3, 4, &[]);
        node.handle_inbound(from(MessageType::Vote, 2, 3)).unwrap();
        node.handle_inbound(from(MessageType::Vote, 1, 4)).unwrap();
        assert!(probe.messages().is_empty());
        assert_eq!(node.status().term, 4);
    }

    #[test]
    fn newer_term_demotes_leader_and_replays_message() {
        let (mut node, mut probe) = leader_with(3, 2, &[]);
        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Vote, 2, 5).last(LogKey::NONE),
        ))
        .unwrap();

        let status = node.status();
        assert_eq!(status.role, RoleKind::Follower);
        assert_eq!(status.term, 5);
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::VoteReply);
        assert!(sent[0].agree);
        assert_eq!(sent[0].term, 5);
        assert!(probe
            .orders()
            .iter()
            .any(|o| matches!(o, StoreOrder::Meta(json) if json.contains("\"term\": 5"))));
    }

    #[test]
    fn follower_grants_one_vote_per_term() {
        let (mut node, mut probe) = node_with(0, 5, 1, &[(1, 0)]);
        let vote = |from, last| {
            Inbound::FromNode(Message::new(MessageType::Vote, from, 1).last(last))
        };

        node.handle_inbound(vote(3, key(0, 9))).unwrap();
        node.handle_inbound(vote(2, key(1, 0))).unwrap();
        node.handle_inbound(vote(4, key(1, 3))).unwrap();
        node.handle_inbound(vote(2, key(1, 0))).unwrap();

        let agrees: Vec<(NodeId, bool)> = probe
            .messages()
            .iter()
            .map(|m| (m.to[0], m.agree))
            .collect();
        assert_eq!(agrees, vec![(3, false), (2, true), (4, false), (2, true)]);
        assert_eq!(node.ctx.meta.vote_in_current_term(), Some(2));
    }

    #[test]
    fn follower_refuses_sync_writes_and_forwards_plain_ones() {
        let (mut node, mut probe) = node_with(1, 3, 1, &[]);
        node.handle_inbound(Inbound::FromClient(ClientWrite {
            client: 7,
            sync: true,
            payload: "set a 1".into(),
        }))
        .unwrap();
        let replies = probe.replies();
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].ok);
        assert!(replies[0]
            .output
            .contains(&ClientRefusal::FollowerCannotSync.to_string()));

        node.handle_inbound(Inbound::FromClient(ClientWrite {
            client: 8,
            sync: false,
            payload: "get a".into(),
        }))
        .unwrap();
        assert_eq!(probe.app_requests(), vec![AppRequest::for_client(8, false, "get a")]);
    }

    #[test]
    fn follower_reports_its_tail_when_logs_diverge() {
        let tail: Vec<_> = (0..=5).map(|i| (0, i)).collect();
        let (mut node, mut probe) = node_with(2, 5, 1, &tail);
        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::AppendLog, 0, 1)
                .keys(key(1, 3), key(1, 2))
                .payload("set x 1"),
        ))
        .unwrap();

        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::AppendLogReply);
        assert!(!sent[0].agree);
        assert_eq!(sent[0].last_log_key, key(1, 3));
        assert_eq!(sent[0].second_last_log_key, key(0, 5));
        assert_eq!(node.ctx.log.last(), key(0, 5));
    }

    #[test]
    fn follower_truncates_uncommitted_suffix_and_undoes_it() {
        let (mut node, mut probe) = node_with(1, 3, 2, &[(0, 0), (1, 0), (1, 1)]);
        node.ctx.log.commit(key(0, 0));

        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::AppendLog, 0, 2)
                .keys(key(2, 0), key(0, 0))
                .payload("set z 9"),
        ))
        .unwrap();

        let requests = probe.app_requests();
        let actions: Vec<(AppAction, &str)> = requests
            .iter()
            .map(|r| (r.action, r.payload.as_str()))
            .collect();
        assert_eq!(
            actions,
            vec![
                (AppAction::Undo, "set k11 v"),
                (AppAction::Undo, "set k10 v"),
                (AppAction::Apply, "set z 9"),
            ]
        );
        let keys: Vec<_> = node.ctx.log.snapshot().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![key(0, 0), key(2, 0)]);
        let sent = probe.messages();
        assert!(sent[0].agree);
        assert_eq!(sent[0].last_log_key, key(2, 0));
    }

    #[test]
    fn follower_caps_commit_of_unknown_key_at_matched() {
        let (mut node, mut probe) = node_with(1, 3, 1, &[(0, 0), (0, 1), (0, 2)]);
        let commit = |last| Inbound::FromNode(Message::new(MessageType::Commit, 0, 1).last(last));

        node.handle_inbound(commit(key(0, 4))).unwrap();
        assert_eq!(node.status().committed, LogKey::NONE);

        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Heartbeat, 0, 1).keys(key(0, 4), key(0, 1)),
        ))
        .unwrap();
        probe.messages();
        node.handle_inbound(commit(key(0, 4))).unwrap();
        assert_eq!(node.status().committed, key(0, 1));
        assert!(probe.orders().contains(&StoreOrder::Flush {
            start: key(0, 0),
            end: key(0, 1),
        }));
    }

    #[test]
    fn candidate_replays_commit_of_stored_key_as_follower() {
        let (mut node, mut probe) = node_with(1, 3, 1, &[(1, 0), (1, 1)]);
        node.handle_timeout().unwrap();
        assert_eq!(node.status().role, RoleKind::Candidate);
        probe.messages();

        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Commit, 0, 1).last(key(1, 1)),
        ))
        .unwrap();
        let status = node.status();
        assert_eq!(status.role, RoleKind::Follower);
        assert_eq!(status.committed, key(1, 1));
        assert!(probe.orders().contains(&StoreOrder::Flush {
            start: key(1, 0),
            end: key(1, 1),
        }));

        // A later matching heartbeat changes nothing.
        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Heartbeat, 0, 1).keys(key(1, 1), key(1, 0)),
        ))
        .unwrap();
        assert_eq!(node.status().committed, key(1, 1));
    }

    #[test]
    fn closed_storage_does_not_block_term_adoption() {
        let (mut node, mut probe) = leader_with(3, 2, &[]);
        probe.storage = unbounded_channel().1;

        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Vote, 2, 5).last(LogKey::NONE),
        ))
        .unwrap();
        let status = node.status();
        assert_eq!(status.role, RoleKind::Follower);
        assert_eq!(status.term, 5);
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].agree);
    }

    #[test]
    fn closed_storage_does_not_stall_an_election() {
        let (mut node, mut probe) = node_with(0, 3, 1, &[]);
        probe.storage = unbounded_channel().1;

        node.handle_timeout().unwrap();
        node.handle_inbound(from(MessageType::PreVoteReply, 1, 1)).unwrap();
        node.handle_inbound(from(MessageType::PreVoteReply, 2, 1)).unwrap();
        probe.messages();

        node.handle_timeout().unwrap();
        assert_eq!(node.status().term, 2);
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Vote);

        // The vote timeout falls back to pre-vote without another bump.
        node.handle_timeout().unwrap();
        assert_eq!(node.status().term, 2);
        assert_eq!(probe.messages()[0].kind, MessageType::PreVote);
    }

    #[test]
    fn election_from_timeout_to_leader() {
        let (mut node, mut probe) = node_with(0, 3, 0, &[(0, 0)]);
        node.handle_timeout().unwrap();
        assert_eq!(node.status().role, RoleKind::Candidate);
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::PreVote);
        assert_eq!(sent[0].to, vec![0, 1, 2]);

        node.handle_inbound(from(MessageType::PreVoteReply, 1, 0)).unwrap();
        node.handle_inbound(from(MessageType::PreVoteReply, 2, 0)).unwrap();
        node.handle_timeout().unwrap();
        assert_eq!(node.status().term, 1);
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::Vote);
        assert_eq!(sent[0].last_log_key, key(0, 0));

        let agree = |from| {
            Inbound::FromNode(Message::new(MessageType::VoteReply, from, 1).agree(true))
        };
        node.handle_inbound(agree(2)).unwrap();
        assert_eq!(node.status().role, RoleKind::Candidate);
        node.handle_inbound(agree(1)).unwrap();
        assert_eq!(node.status().role, RoleKind::Leader);
        let sent = probe.messages();
        assert_eq!(sent[0].kind, MessageType::Heartbeat);
        assert_eq!(sent[0].last_log_key, key(0, 0));
    }

    #[test]
    fn candidate_steps_down_on_same_term_leader() {
        let (mut node, mut probe) = node_with(0, 3, 2, &[]);
        node.handle_timeout().unwrap();
        probe.messages();
        node.handle_inbound(Inbound::FromNode(
            Message::new(MessageType::Heartbeat, 1, 2).keys(LogKey::NONE, LogKey::NONE),
        ))
        .unwrap();
        assert_eq!(node.status().role, RoleKind::Follower);
    }

    #[test]
    fn leader_commits_on_third_acknowledgement() {
        let (mut node, mut probe) = leader_with(5, 1, &[]);
        node.handle_inbound(Inbound::FromClient(ClientWrite {
            client: 11,
            sync: true,
            payload: "set a 1".into(),
        }))
        .unwrap();
        assert_eq!(
            probe.app_requests(),
            vec![AppRequest::for_client(11, true, "set a 1")]
        );

        node.handle_app_response(AppResponse {
            client: 11,
            need_sync: true,
            output: "a = 1".into(),
            accepted: true,
        })
        .unwrap();
        let sent = probe.messages();
        assert_eq!(sent[0].kind, MessageType::AppendLog);
        assert_eq!(sent[0].last_log_key, key(1, 0));
        assert_eq!(sent[0].second_last_log_key, LogKey::NONE);
        assert_eq!(sent[0].payload, "set a 1");

        node.handle_inbound(reply(1, 1, true, key(1, 0), LogKey::NONE)).unwrap();
        node.handle_inbound(reply(2, 1, true, key(1, 0), LogKey::NONE)).unwrap();
        assert_eq!(node.status().committed, LogKey::NONE);
        assert!(probe.replies().is_empty());

        node.handle_inbound(reply(3, 1, true, key(1, 0), LogKey::NONE)).unwrap();
        assert_eq!(node.status().committed, key(1, 0));
        let mut outbound = Vec::new();
        while let Ok(item) = probe.outbound.try_recv() {
            outbound.push(item);
        }
        assert!(outbound.contains(&Outbound::ClientReply(ClientReply::ok(11, "a = 1"))));
        assert!(outbound.iter().any(|o| matches!(
            o,
            Outbound::NodeReply(m) if m.kind == MessageType::Commit
                && m.last_log_key == key(1, 0)
                && m.to == vec![0, 1, 2, 3, 4]
        )));
        assert!(probe.orders().contains(&StoreOrder::Flush {
            start: key(1, 0),
            end: key(1, 0),
        }));

        // A late acknowledgement for a committed key gets a direct Commit.
        node.handle_inbound(reply(4, 1, true, key(1, 0), LogKey::NONE)).unwrap();
        let sent = probe.messages();
        assert_eq!(sent[0].kind, MessageType::Commit);
        assert_eq!(sent[0].to, vec![4]);
    }

    #[test]
    fn leader_does_not_commit_older_term_entry_by_count() {
        let (mut node, _probe) = leader_with(3, 2, &[(1, 0)]);
        node.handle_inbound(reply(1, 2, true, key(1, 0), LogKey::NONE)).unwrap();
        node.handle_inbound(reply(2, 2, true, key(1, 0), LogKey::NONE)).unwrap();
        assert_eq!(node.status().committed, LogKey::NONE);
    }

    #[test]
    fn leader_repairs_from_follower_tail() {
        let mut keys: Vec<_> = (0..=5).map(|i| (0, i)).collect();
        keys.extend((0..=3).map(|i| (1, i)));
        let (mut node, mut probe) = leader_with(5, 1, &keys);

        node.handle_inbound(reply(2, 1, false, key(1, 3), key(0, 5))).unwrap();
        let sent = probe.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::AppendLog);
        assert_eq!(sent[0].to, vec![2]);
        assert_eq!(sent[0].last_log_key, key(1, 0));
        assert_eq!(sent[0].second_last_log_key, key(0, 5));
        assert_eq!(sent[0].payload, "set k10 v");

        // Unknown follower tail: step back from the rejected proposal.
        node.handle_inbound(reply(3, 1, false, key(1, 3), key(0, 9))).unwrap();
        let sent = probe.messages();
        assert_eq!(sent[0].last_log_key, key(1, 2));
        assert_eq!(sent[0].second_last_log_key, key(1, 1));
    }

    #[test]
    fn leader_streams_next_entry_after_acknowledgement() {
        let (mut node, mut probe) = leader_with(3, 1, &[(0, 0), (0, 1)]);
        node.handle_inbound(reply(1, 1, true, key(0, 0), LogKey::NONE)).unwrap();
        let sent = probe.messages();
        assert_eq!(sent[0].kind, MessageType::AppendLog);
        assert_eq!(sent[0].last_log_key, key(0, 1));
        assert_eq!(sent[0].second_last_log_key, key(0, 0));
        assert_eq!(sent[0].to, vec![1]);
    }

    #[test]
    fn two_leaders_in_one_term_is_fatal() {
        let (mut node, _probe) = leader_with(3, 3, &[]);
        let err = node
            .handle_inbound(from(MessageType::Heartbeat, 2, 3))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            RaftError::Fatal(Fatal::DualLeader { term: 3, from: 2 })
        ));
    }

    #[test]
    fn follower_ahead_of_leader_is_fatal() {
        let (mut node, _probe) = leader_with(3, 1, &[(1, 0)]);
        let err = node
            .handle_inbound(reply(1, 1, true, key(1, 4), key(1, 3)))
            .unwrap_err();
        assert!(matches!(err, RaftError::Fatal(Fatal::FollowerAhead { .. })));
    }

    #[test]
    fn rejected_application_output_fails_client() {
        let (mut node, mut probe) = leader_with(3, 1, &[]);
        node.handle_inbound(Inbound::FromClient(ClientWrite {
            client: 5,
            sync: true,
            payload: "bogus".into(),
        }))
        .unwrap();
        node.handle_app_response(AppResponse {
            client: 5,
            need_sync: true,
            output: "invalid command".into(),
            accepted: false,
        })
        .unwrap();
        assert_eq!(
            probe.replies(),
            vec![ClientReply::failed(5, "invalid command")]
        );
        assert_eq!(node.status().pending_clients, 0);
        assert_eq!(node.status().last, LogKey::NONE);
    }
}
