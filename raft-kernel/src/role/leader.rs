use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::app::AppRequest;
use crate::error::{Fatal, Result};
use crate::log::{Index, LogEntry, LogKey};
use crate::message::{ClientId, ClientWrite, Message, MessageType, NodeId};
use crate::node::NodeContext;

use super::{Role, RoleKind, Transition};

/// Sole writer of the log for its term.
pub struct Leader {
    next_index: Index,
    /// Followers that acknowledged each uncommitted key.
    acks: HashMap<LogKey, HashSet<NodeId>>,
}

impl Leader {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            acks: HashMap::new(),
        }
    }

    fn heartbeat(&self, ctx: &mut NodeContext) {
        let msg = ctx
            .message(MessageType::Heartbeat)
            .keys(ctx.log.last(), ctx.log.second_last());
        ctx.broadcast(msg);
        let interval = ctx.meta.heartbeat_interval();
        ctx.timer.reset(interval);
    }

    fn send_entry(ctx: &NodeContext, to: NodeId, key: LogKey, prev: LogKey) -> Result<()> {
        let payload = ctx.log.get(key)?;
        let msg = ctx
            .message(MessageType::AppendLog)
            .to(vec![to])
            .keys(key, prev)
            .payload(payload);
        ctx.send(msg);
        Ok(())
    }

    fn dual_leader(msg: &Message, ctx: &NodeContext) -> Result<Transition> {
        Err(Fatal::DualLeader {
            term: ctx.term(),
            from: msg.from,
        }
        .into())
    }

    fn acknowledged(&mut self, msg: &Message, ctx: &mut NodeContext) -> Result<()> {
        let acked = msg.last_log_key;
        if acked <= ctx.log.committed() {
            // Already committed here; let the follower catch up directly.
            let commit = ctx
                .message(MessageType::Commit)
                .to(vec![msg.from])
                .last(acked);
            ctx.send(commit);
        } else {
            let voters = self.acks.entry(acked).or_default();
            voters.insert(msg.from);
            let count = voters.len();
            debug!(node = ctx.id(), key = %acked, acks = count, "acknowledged");

            if count >= ctx.quorum() && acked.term == ctx.term() {
                if let Some((_, end)) = ctx.commit_through(acked) {
                    self.acks.retain(|key, _| *key > end);
                }
                ctx.broadcast(ctx.message(MessageType::Commit).last(acked));
                let interval = ctx.meta.heartbeat_interval();
                ctx.timer.reset(interval);
            }
        }

        match ctx.log.next(acked) {
            Ok(next) if !next.is_none() => Self::send_entry(ctx, msg.from, next, acked),
            _ => Ok(()),
        }
    }

    fn rejected(&mut self, msg: &Message, ctx: &mut NodeContext) -> Result<()> {
        let follower_tail = msg.second_last_log_key;
        let (key, prev) = match ctx.log.next(follower_tail) {
            Ok(next) if !next.is_none() => (next, follower_tail),
            _ => {
                // The follower's tail is not in our log; back off one entry
                // from the rejected proposal.
                let key = match ctx.log.previous(msg.last_log_key) {
                    Ok(prev) if !prev.is_none() => prev,
                    _ => ctx.log.next(LogKey::NONE)?,
                };
                (key, ctx.log.previous(key)?)
            }
        };
        debug!(node = ctx.id(), follower = msg.from, key = %key, prev = %prev, "repairing follower");
        Self::send_entry(ctx, msg.from, key, prev)
    }
}

impl Default for Leader {
    fn default() -> Self {
        Self::new()
    }
}

impl Role for Leader {
    fn kind(&self) -> RoleKind {
        RoleKind::Leader
    }

    fn enter(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        info!(node = ctx.id(), term = ctx.term(), last = %ctx.log.last(), "leading");
        self.heartbeat(ctx);
        Ok(Transition::Stay)
    }

    fn handle_heartbeat(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::dual_leader(&msg, ctx)
    }

    fn handle_append_log(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::dual_leader(&msg, ctx)
    }

    fn handle_commit(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::dual_leader(&msg, ctx)
    }

    fn handle_append_log_reply(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        let last = ctx.log.last();
        if msg.last_log_key > last {
            return Err(Fatal::FollowerAhead {
                follower: msg.from,
                reported: msg.last_log_key,
                leader_last: last,
            }
            .into());
        }

        if msg.agree {
            self.acknowledged(&msg, ctx)?;
        } else {
            self.rejected(&msg, ctx)?;
        }
        Ok(Transition::Stay)
    }

    /// A vote request in our own term means someone lost contact; assert
    /// leadership straight away.
    fn handle_vote(&mut self, _msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        self.heartbeat(ctx);
        Ok(Transition::Stay)
    }

    fn handle_pre_vote(&mut self, _msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        self.heartbeat(ctx);
        Ok(Transition::Stay)
    }

    fn handle_client_write(
        &mut self,
        write: ClientWrite,
        ctx: &mut NodeContext,
    ) -> Result<Transition> {
        if write.sync {
            ctx.sync.track(write.client, write.payload.clone());
        }
        ctx.to_app(AppRequest::for_client(write.client, write.sync, write.payload))?;
        Ok(Transition::Stay)
    }

    fn handle_client_sync(&mut self, client: ClientId, ctx: &mut NodeContext) -> Result<Transition> {
        let Some(payload) = ctx.sync.payload(client).map(str::to_owned) else {
            return Ok(Transition::Stay);
        };
        let prev = ctx.log.last();
        let key = LogKey::new(ctx.term(), self.next_index);
        self.next_index += 1;

        ctx.log.append(LogEntry::new(key, payload.clone()));
        ctx.sync.bind(key, client);
        self.acks.insert(key, HashSet::new());
        debug!(node = ctx.id(), key = %key, client, "proposed");

        let msg = ctx
            .message(MessageType::AppendLog)
            .keys(key, prev)
            .payload(payload);
        ctx.broadcast(msg);
        let interval = ctx.meta.heartbeat_interval();
        ctx.timer.reset(interval);
        Ok(Transition::Stay)
    }

    fn handle_timeout(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        self.heartbeat(ctx);
        Ok(Transition::Stay)
    }

    fn describe(&self) -> String {
        format!(
            "leader (next index {}, {} keys awaiting quorum)",
            self.next_index,
            self.acks.len()
        )
    }
}
