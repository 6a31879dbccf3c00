//! Node metadata: identity, cluster layout, timeouts and the persisted term.
//!
//! The same JSON document is the node's configuration file and its durable
//! state; the node rewrites it whenever the term, vote or commit marker
//! changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::log::{Index, LogKey, Term};
use crate::message::NodeId;

/// A vote granted in a given term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: Term,
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub id: NodeId,
    /// Number of cluster members; members are `0..num`.
    pub num: u64,
    pub term: Term,
    pub committed_term: Term,
    pub committed_index: Index,
    pub voted_for: Option<Vote>,
    /// Member addresses, indexed by node id.
    pub dns: Vec<String>,
    /// Leader heartbeat interval (ms).
    pub leader_heartbeat: u64,
    /// Follower silence before it becomes a candidate (ms).
    pub follower_timeout: u64,
    /// Pre-vote and election-backoff timeout (ms).
    pub candidate_pre_vote_timeout: u64,
    /// Time a real election may take before falling back to pre-vote (ms).
    pub candidate_vote_timeout: u64,
    /// Upper bound of the random pause between a won pre-vote and the vote (ms).
    pub candidate_vote_jitter: u64,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            id: 0,
            num: 1,
            term: 0,
            committed_term: -1,
            committed_index: -1,
            voted_for: None,
            dns: Vec::new(),
            leader_heartbeat: 50,
            follower_timeout: 300,
            candidate_pre_vote_timeout: 150,
            candidate_vote_timeout: 300,
            candidate_vote_jitter: 100,
        }
    }
}

impl Meta {
    /// Metadata for member `id` of a fresh `num`-node cluster with default timeouts.
    pub fn for_member(id: NodeId, num: u64) -> Self {
        Self {
            id,
            num,
            ..Self::default()
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        (0..self.num).collect()
    }

    /// Strict majority of the cluster.
    pub fn quorum(&self) -> usize {
        (self.num / 2 + 1) as usize
    }

    pub fn committed(&self) -> LogKey {
        LogKey::new(self.committed_term, self.committed_index)
    }

    pub fn set_committed(&mut self, key: LogKey) {
        self.committed_term = key.term;
        self.committed_index = key.index;
    }

    /// Candidate this node voted for in the current term, if any.
    pub fn vote_in_current_term(&self) -> Option<NodeId> {
        self.voted_for
            .filter(|vote| vote.term == self.term)
            .map(|vote| vote.node)
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.dns.get(id as usize).map(String::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.leader_heartbeat)
    }

    pub fn follower_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_timeout)
    }

    pub fn pre_vote_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_pre_vote_timeout)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_vote_timeout)
    }
}
