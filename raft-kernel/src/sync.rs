//! Bookkeeping for client writes that wait on replication.
//!
//! A synchronous write goes through two steps: the application executes it,
//! then the leader appends it to the log. The ledger remembers the request
//! by client id from the moment the leader accepts it, and by [`LogKey`]
//! once the entry exists. Each key has at most one waiting client. A commit
//! that covers the key answers the client with the application's output. A
//! truncation that removes it fails the client.

use std::collections::HashMap;

use crate::log::LogKey;
use crate::message::{ClientId, ClientReply};

pub const ROLLBACK_NOTICE: &str = "sync failed, rollback later";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    /// The write as the client sent it; this is what gets replicated.
    payload: String,
    /// Application output, returned to the client on commit.
    output: Option<String>,
    key: Option<LogKey>,
}

#[derive(Debug, Default)]
pub struct SyncLedger {
    by_client: HashMap<ClientId, Pending>,
    by_key: HashMap<LogKey, ClientId>,
}

impl SyncLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a synchronous write accepted by the leader.
    pub fn track(&mut self, client: ClientId, payload: impl Into<String>) {
        self.by_client.insert(
            client,
            Pending {
                payload: payload.into(),
                output: None,
                key: None,
            },
        );
    }

    pub fn is_tracked(&self, client: ClientId) -> bool {
        self.by_client.contains_key(&client)
    }

    /// Original payload of a tracked write.
    pub fn payload(&self, client: ClientId) -> Option<&str> {
        self.by_client.get(&client).map(|p| p.payload.as_str())
    }

    /// Stores the application's answer until the write commits.
    pub fn record_output(&mut self, client: ClientId, output: impl Into<String>) {
        if let Some(pending) = self.by_client.get_mut(&client) {
            pending.output = Some(output.into());
        }
    }

    /// Ties a tracked write to the log entry that carries it.
    pub fn bind(&mut self, key: LogKey, client: ClientId) {
        if let Some(pending) = self.by_client.get_mut(&client) {
            pending.key = Some(key);
            if let Some(previous) = self.by_key.insert(key, client) {
                debug_assert_eq!(previous, client, "two clients bound to {key}");
            }
        }
    }

    /// Drops a write without answering it.
    pub fn forget(&mut self, client: ClientId) {
        if let Some(pending) = self.by_client.remove(&client) {
            if let Some(key) = pending.key {
                self.by_key.remove(&key);
            }
        }
    }

    /// Success replies for every bound write among `keys`.
    pub fn resolve(&mut self, keys: impl IntoIterator<Item = LogKey>) -> Vec<ClientReply> {
        keys.into_iter()
            .filter_map(|key| {
                let client = self.by_key.remove(&key)?;
                let pending = self.by_client.remove(&client)?;
                Some(ClientReply::ok(client, pending.output.unwrap_or_default()))
            })
            .collect()
    }

    /// Failure reply for the write bound to a truncated entry, if any.
    pub fn fail(&mut self, key: LogKey) -> Option<ClientReply> {
        let client = self.by_key.remove(&key)?;
        self.by_client.remove(&client);
        Some(ClientReply::failed(client, ROLLBACK_NOTICE))
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}
