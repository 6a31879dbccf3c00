//! The three Raft roles.
//!
//! A role is created fresh every time the node enters it, so role-local state
//! (ballots, acknowledgement sets, the next log index) never leaks across
//! terms. Handlers receive messages that already passed term filtering and
//! report what the node should become next with a [`Transition`]; the node
//! loop performs the switch.

mod candidate;
mod follower;
mod leader;

use std::fmt;

use crate::error::Result;
use crate::message::{ClientId, ClientWrite, Message, MessageType};
use crate::node::NodeContext;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// What the node loop should do after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    /// Become a follower in the current term, then re-dispatch `replay`.
    Follower { replay: Option<Message> },
    Candidate,
    Leader,
}

pub trait Role: Send {
    fn kind(&self) -> RoleKind;

    /// Called once right after the node switches into this role.
    fn enter(&mut self, ctx: &mut NodeContext) -> Result<Transition>;

    fn handle_heartbeat(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition>;
    fn handle_append_log(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition>;
    fn handle_commit(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition>;
    fn handle_vote(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition>;
    fn handle_pre_vote(&mut self, msg: Message, ctx: &mut NodeContext) -> Result<Transition>;

    fn handle_append_log_reply(
        &mut self,
        _msg: Message,
        _ctx: &mut NodeContext,
    ) -> Result<Transition> {
        Ok(Transition::Stay)
    }

    fn handle_vote_reply(&mut self, _msg: Message, _ctx: &mut NodeContext) -> Result<Transition> {
        Ok(Transition::Stay)
    }

    fn handle_pre_vote_reply(
        &mut self,
        _msg: Message,
        _ctx: &mut NodeContext,
    ) -> Result<Transition> {
        Ok(Transition::Stay)
    }

    /// First phase of a client write: decide whether the application runs it.
    fn handle_client_write(
        &mut self,
        write: ClientWrite,
        ctx: &mut NodeContext,
    ) -> Result<Transition>;

    /// Second phase of a synchronous write, after the application accepted it.
    fn handle_client_sync(&mut self, client: ClientId, ctx: &mut NodeContext)
        -> Result<Transition>;

    fn handle_timeout(&mut self, ctx: &mut NodeContext) -> Result<Transition>;

    /// One-line summary of role-local state for the operator console.
    fn describe(&self) -> String {
        self.kind().to_string()
    }
}

/// Routes a peer message to the matching handler.
pub(crate) fn dispatch(
    role: &mut dyn Role,
    msg: Message,
    ctx: &mut NodeContext,
) -> Result<Transition> {
    match msg.kind {
        MessageType::Heartbeat => role.handle_heartbeat(msg, ctx),
        MessageType::AppendLog => role.handle_append_log(msg, ctx),
        MessageType::AppendLogReply => role.handle_append_log_reply(msg, ctx),
        MessageType::Commit => role.handle_commit(msg, ctx),
        MessageType::Vote => role.handle_vote(msg, ctx),
        MessageType::VoteReply => role.handle_vote_reply(msg, ctx),
        MessageType::PreVote => role.handle_pre_vote(msg, ctx),
        MessageType::PreVoteReply => role.handle_pre_vote_reply(msg, ctx),
    }
}
