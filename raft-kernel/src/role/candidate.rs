use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::error::{ClientRefusal, Result};
use crate::message::{ClientId, ClientWrite, Message, MessageType, NodeId};
use crate::node::NodeContext;

use super::{Role, RoleKind, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Probing whether a quorum is reachable, without touching the term.
    PreElection,
    /// Pre-vote won; waiting out a random pause before asking for votes.
    AwaitingVote,
    /// Votes requested in the current term.
    Electing,
}

/// Runs PreVote, then a real election.
pub struct Candidate {
    phase: Phase,
    ballots: HashMap<NodeId, bool>,
}

impl Candidate {
    pub fn new() -> Self {
        Self {
            phase: Phase::PreElection,
            ballots: HashMap::new(),
        }
    }

    fn start_pre_election(&mut self, ctx: &mut NodeContext) {
        self.phase = Phase::PreElection;
        self.ballots.clear();
        ctx.broadcast(ctx.message(MessageType::PreVote));
        let timeout = ctx.meta.pre_vote_timeout();
        ctx.timer.reset(timeout);
    }

    fn request_votes(&mut self, ctx: &mut NodeContext) {
        ctx.meta.term += 1;
        ctx.persist_meta();
        self.phase = Phase::Electing;
        self.ballots.clear();
        info!(node = ctx.id(), term = ctx.term(), "requesting votes");
        ctx.broadcast(ctx.message(MessageType::Vote).last(ctx.log.last()));
        let timeout = ctx.meta.vote_timeout();
        ctx.timer.reset(timeout);
    }

    fn tally(&self) -> (usize, usize) {
        let agree = self.ballots.values().filter(|&&agree| agree).count();
        (agree, self.ballots.len() - agree)
    }
}

impl Default for Candidate {
    fn default() -> Self {
        Self::new()
    }
}

impl Role for Candidate {
    fn kind(&self) -> RoleKind {
        RoleKind::Candidate
    }

    fn enter(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        self.start_pre_election(ctx);
        Ok(Transition::Stay)
    }

    fn handle_heartbeat(&mut self, msg: Message, _ctx: &mut NodeContext) -> Result<Transition> {
        Ok(Transition::Follower { replay: Some(msg) })
    }

    fn handle_append_log(&mut self, msg: Message, _ctx: &mut NodeContext) -> Result<Transition> {
        Ok(Transition::Follower { replay: Some(msg) })
    }

    fn handle_commit(&mut self, msg: Message, _ctx: &mut NodeContext) -> Result<Transition> {
        Ok(Transition::Follower { replay: Some(msg) })
    }

    fn handle_vote(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        let mut reply = ctx
            .message(MessageType::VoteReply)
            .to(vec![msg.from])
            .agree(false);
        reply.second_last_log_key = ctx.log.last();
        ctx.send(reply);
        Ok(Transition::Stay)
    }

    fn handle_vote_reply(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        if self.phase != Phase::Electing {
            return Ok(Transition::Stay);
        }
        self.ballots.insert(msg.from, msg.agree);
        let (agree, refuse) = self.tally();
        debug!(node = ctx.id(), from = msg.from, agree, refuse, "vote reply");

        if agree >= ctx.quorum() {
            info!(node = ctx.id(), term = ctx.term(), votes = agree, "won election");
            return Ok(Transition::Leader);
        }
        if refuse >= ctx.quorum() {
            info!(node = ctx.id(), term = ctx.term(), refusals = refuse, "lost election");
            return Ok(Transition::Follower { replay: None });
        }
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

    fn handle_pre_vote_reply(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition> {
        if self.phase != Phase::PreElection {
            return Ok(Transition::Stay);
        }
        self.ballots.insert(msg.from, true);
        if self.ballots.len() >= ctx.quorum() {
            self.ballots.clear();
            self.phase = Phase::AwaitingVote;
            let jitter = rand::thread_rng().gen_range(0..=ctx.meta.candidate_vote_jitter);
            debug!(node = ctx.id(), pause_ms = jitter, "pre-vote quorum reached");
            ctx.timer.reset(Duration::from_millis(jitter));
        }
        Ok(Transition::Stay)
    }

    fn handle_client_write(
        &mut self,
        _write: ClientWrite,
        _ctx: &mut NodeContext,
    ) -> Result<Transition> {
        Err(ClientRefusal::CandidateRefuses.into())
    }

    fn handle_client_sync(&mut self, _client: ClientId, _ctx: &mut NodeContext) -> Result<Transition> {
        Err(ClientRefusal::NotLeader.into())
    }

    fn handle_timeout(&mut self, ctx: &mut NodeContext) -> Result<Transition> {
        match self.phase {
            Phase::PreElection => self.start_pre_election(ctx),
            Phase::AwaitingVote => self.request_votes(ctx),
            Phase::Electing => {
                debug!(node = ctx.id(), term = ctx.term(), "election timed out, back to pre-vote");
                self.start_pre_election(ctx);
            }
        }
        Ok(Transition::Stay)
    }

    fn describe(&self) -> String {
        let (agree, refuse) = self.tally();
        format!("candidate ({:?}, {agree} agree / {refuse} refuse)", self.phase)
    }
}
