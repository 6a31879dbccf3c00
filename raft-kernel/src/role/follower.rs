use tracing::{debug, info};

use crate::app::AppRequest;
use crate::error::{ClientRefusal, Fatal, Result};
use crate::log::{LogEntry, LogKey};
use crate::message::{ClientId, ClientWrite, Message, MessageType, NodeId};
use crate::meta::{Meta, Vote};
use crate::node::NodeContext;

use super::{Role, RoleKind, Transition};

/// Passive replica: repairs its log to match the leader's and votes.
pub struct Follower {
    voted_for: Option<NodeId>,
    /// Newest key known to match the current leader's log.
    matched: LogKey,
}

impl Follower {
    pub fn new(meta: &Meta) -> Self {
        Self {
            voted_for: meta.vote_in_current_term(),
            matched: LogKey::NONE,
        }
    }

    fn reset_timer(ctx: &mut NodeContext) {
        let timeout = ctx.meta.follower_timeout();
        ctx.timer.reset(timeout);
    }
}

impl Role for Follower {
    fn kind(&self) -> RoleKind {
        RoleKind::Follower
    }

    fn enter(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        Self::reset_timer(ctx);
        Ok(Transition::Stay)
    }

    fn handle_heartbeat(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::reset_timer(ctx);
        let tail = ctx.log.last();
        if tail == msg.last_log_key || tail == msg.second_last_log_key {
            self.matched = tail;
        }
        if tail < msg.last_log_key {
            return self.handle_append_log(msg, ctx);
        }
        Ok(Transition::Stay)
    }

    /// Repairs toward the leader's log. Also runs for heartbeats that show
    /// this log is behind, in which case nothing is appended.
    fn handle_append_log(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::reset_timer(ctx);
        if msg.last_log_key <= ctx.log.committed() {
            return Ok(Transition::Stay);
        }

        let prev = msg.second_last_log_key;
        if ctx.log.last() > prev {
            let removed = ctx.log.remove(prev).map_err(Fatal::CommittedRollback)?;
            info!(
                node = ctx.id(),
                after = %prev,
                removed = removed.len(),
                "truncated log to match leader"
            );
            ctx.roll_back(removed)?;
            self.matched = self.matched.min(ctx.log.last());
        }

        let tail = ctx.log.last();
        let mut reply = ctx
            .message(MessageType::AppendLogReply)
            .to(vec![msg.from])
            .last(msg.last_log_key);

        if tail == prev && msg.kind == MessageType::AppendLog {
            if ctx.log.append(LogEntry::new(msg.last_log_key, msg.payload.clone())) {
                ctx.to_app(AppRequest::replicated(msg.payload))?;
            }
            self.matched = msg.last_log_key;
            reply = reply.agree(true);
            debug!(node = ctx.id(), key = %msg.last_log_key, "appended");
        } else {
            if tail == prev {
                self.matched = tail;
            }
            reply.second_last_log_key = tail;
        }
        ctx.send(reply);
        Ok(Transition::Stay)
    }

    /// A key stored here under the same (term, index) was appended on a
    /// matching prefix, so it commits as is. Anything else is capped at the
    /// newest key verified against this leader.
    fn handle_commit(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        Self::reset_timer(ctx);
        let key = msg.last_log_key;
        let target = match ctx.log.get(key) {
            Ok(_) => key,
            Err(_) => key.min(self.matched),
        };
        if target > ctx.log.committed() {
            ctx.commit_through(target);
            self.matched = self.matched.max(target);
        }
        Ok(Transition::Stay)
    }

    fn handle_vote(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        let tail = ctx.log.last();
        let taken = matches!(self.voted_for, Some(node) if node != msg.from);
        let reply = ctx.message(MessageType::VoteReply).to(vec![msg.from]);

        if taken || tail > msg.last_log_key {
            debug!(node = ctx.id(), candidate = msg.from, voted_for = ?self.voted_for, tail = %tail, "vote refused");
            let mut reply = reply.agree(false);
            reply.second_last_log_key = tail;
            ctx.send(reply);
            return Ok(Transition::Stay);
        }

        self.voted_for = Some(msg.from);
        ctx.meta.voted_for = Some(Vote {
            term: ctx.term(),
            node: msg.from,
        });
        ctx.persist_meta();
        info!(node = ctx.id(), term = ctx.term(), candidate = msg.from, "vote granted");
        ctx.send(reply.agree(true));
        Ok(Transition::Stay)
    }

    fn handle_pre_vote(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        let reply = ctx
            .message(MessageType::PreVoteReply)
            .to(vec![msg.from])
            .agree(true);
        ctx.send(reply);
        Ok(Transition::Stay)
    }

    fn handle_client_write(
        &mut self,
        write: ClientWrite,
        ctx: &mut NodeContext,
    ) -> Result<Transition> {
        if write.sync {
            return Err(ClientRefusal::FollowerCannotSync.into());
        }
        ctx.to_app(AppRequest::for_client(write.client, false, write.payload))?;
        Ok(Transition::Stay)
    }

    fn handle_client_sync(&mut self, _client: ClientId, _ctx: &mut NodeContext) -> Result<Transition> {
        Err(ClientRefusal::NotLeader.into())
    }

    fn handle_timeout(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        info!(node = ctx.id(), term = ctx.term(), "leader silent, starting election");
        Ok(Transition::Candidate)
    }

    fn describe(&self) -> String {
        match self.voted_for {
            Some(node) => format!("follower (voted for {node}, matched {})", self.matched),
            None => format!("follower (matched {})", self.matched),
        }
    }
}
