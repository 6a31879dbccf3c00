//! Error types for the consensus kernel.
//!
//! Stale input is never an error: it is dropped before it gets here. What
//! remains falls in three groups. [`Fatal`] protocol violations stop the
//! node. [`ClientRefusal`]s go back to the client. Everything else is logged
//! and the node keeps serving.

use thiserror::Error;

use crate::log::{LogKey, Term};
use crate::message::NodeId;

/// Failures of [`crate::log::LogStore`] operations and of the line codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("no log entry with key {0}")]
    NotFound(LogKey),
    #[error("attempted to remove committed log: requested {requested}, committed {committed}")]
    RemoveCommitted { requested: LogKey, committed: LogKey },
    #[error("illegal log line: {0:?}")]
    Malformed(String),
}

/// Consistency violations. The node must stop rather than mask them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fatal {
    #[error("two leaders in term {term}: node {from} acted as leader while this node leads")]
    DualLeader { term: Term, from: NodeId },
    #[error("follower {follower} reported key {reported} beyond leader tail {leader_last}")]
    FollowerAhead {
        follower: NodeId,
        reported: LogKey,
        leader_last: LogKey,
    },
    #[error("log repair tried to roll back committed entries: {0}")]
    CommittedRollback(LogError),
}

/// Reasons a client write is turned away before reaching the application.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ClientRefusal {
    #[error("follower refuses to sync")]
    FollowerCannotSync,
    #[error("candidate refuses client requests while an election is in progress")]
    CandidateRefuses,
    #[error("node is not the leader and cannot sync")]
    NotLeader,
}

#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Fatal(#[from] Fatal),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Refused(#[from] ClientRefusal),
    #[error("failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

impl RaftError {
    /// Whether this error must terminate the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(_))
    }
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_protocol_violations_are_fatal() {
        let fatal: RaftError = Fatal::DualLeader { term: 2, from: 3 }.into();
        assert!(fatal.is_fatal());

        let refused: RaftError = ClientRefusal::FollowerCannotSync.into();
        assert!(!refused.is_fatal());

        let log: RaftError = LogError::NotFound(LogKey::NONE).into();
        assert!(!log.is_fatal());
    }

    #[test]
    fn messages_name_the_keys_involved() {
        let err = LogError::RemoveCommitted {
            requested: LogKey::new(1, 0),
            committed: LogKey::new(1, 2),
        };
        assert_eq!(
            err.to_string(),
            "attempted to remove committed log: requested (1,0), committed (1,2)"
        );
    }
}
