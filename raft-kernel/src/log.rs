//! The replicated log.
//!
//! Entries are keyed by [`LogKey`] (term first, then index) and kept in a
//! strictly increasing sequence. [`LogStore`] is the one structure shared
//! between the node loop and the storage task, so it is guarded by a
//! reader/writer lock: any number of readers, writers (`append`, `commit`,
//! `remove`) are exclusive.

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// Election epoch. Signed so that the `-1` sentinel fits.
pub type Term = i64;

/// Position of an entry within its term.
pub type Index = i64;

/// Identifies a log entry. Ordered by term, then index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogKey {
    pub term: Term,
    pub index: Index,
}

impl LogKey {
    /// Sentinel meaning "no entry".
    pub const NONE: LogKey = LogKey { term: -1, index: -1 };

    pub const fn new(term: Term, index: Index) -> Self {
        Self { term, index }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for LogKey {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.term, self.index)
    }
}

/// A single immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: LogKey,
    pub payload: String,
}

impl LogEntry {
    pub fn new(key: LogKey, payload: impl Into<String>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Encodes the entry as a `term$index^payload` line (without the newline).
    pub fn encode(&self) -> String {
        format!("{}${}^{}", self.key.term, self.key.index, self.payload)
    }

    /// Parses a line produced by [`LogEntry::encode`].
    ///
    /// Only the first `^` separates the key from the payload, so the payload
    /// may itself contain `^` or `$`.
    pub fn decode(line: &str) -> Result<Self, LogError> {
        let malformed = || LogError::Malformed(line.to_string());
        let (head, payload) = line.split_once('^').ok_or_else(malformed)?;
        let (term, index) = head.split_once('$').ok_or_else(malformed)?;
        let term = term.trim().parse::<Term>().map_err(|_| malformed())?;
        let index = index.trim().parse::<Index>().map_err(|_| malformed())?;
        Ok(Self::new(LogKey::new(term, index), payload))
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    committed: LogKey,
}

impl LogState {
    /// Position of `key`, if stored.
    fn position(&self, key: LogKey) -> Option<usize> {
        self.entries.binary_search_by(|e| e.key.cmp(&key)).ok()
    }

    /// Number of entries whose key is `<= key`.
    fn count_up_to(&self, key: LogKey) -> usize {
        self.entries.partition_point(|e| e.key <= key)
    }

    fn key_at(&self, pos: usize) -> LogKey {
        self.entries.get(pos).map_or(LogKey::NONE, |e| e.key)
    }
}

/// Ordered, concurrency-safe sequence of log entries with a commit marker.
#[derive(Debug, Default)]
pub struct LogStore {
    state: RwLock<LogState>,
}

impl LogStore {
    /// Creates an empty log with nothing committed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries and the persisted commit marker.
    ///
    /// Entries go through [`LogStore::append`], so duplicates and out-of-order
    /// lines in the persisted file are dropped.
    pub fn hydrate(entries: impl IntoIterator<Item = LogEntry>, committed: LogKey) -> Self {
        let store = Self::new();
        for entry in entries {
            store.append(entry);
        }
        store.write().committed = committed;
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Key of the newest entry, or [`LogKey::NONE`].
    pub fn last(&self) -> LogKey {
        let state = self.read();
        state.entries.last().map_or(LogKey::NONE, |e| e.key)
    }

    /// Key of the entry before the newest one, or [`LogKey::NONE`].
    pub fn second_last(&self) -> LogKey {
        let state = self.read();
        match state.entries.len() {
            n if n >= 2 => state.entries[n - 2].key,
            _ => LogKey::NONE,
        }
    }

    pub fn committed(&self) -> LogKey {
        self.read().committed
    }

    /// Appends `entry` iff its key is strictly greater than the current tail.
    ///
    /// Returns whether the entry was stored. Replayed or retried appends are
    /// silently ignored.
    pub fn append(&self, entry: LogEntry) -> bool {
        let mut state = self.write();
        let newer = state.entries.last().map_or(true, |tail| tail.key < entry.key);
        if newer {
            state.entries.push(entry);
        }
        newer
    }

    /// Stored key immediately before `key`.
    ///
    /// `Ok(LogKey::NONE)` when `key` is the first entry, `Err` when `key` is
    /// not stored at all.
    pub fn previous(&self, key: LogKey) -> Result<LogKey, LogError> {
        let state = self.read();
        let pos = state.position(key).ok_or(LogError::NotFound(key))?;
        Ok(match pos {
            0 => LogKey::NONE,
            _ => state.key_at(pos - 1),
        })
    }

    /// Stored key immediately after `key`.
    ///
    /// `next(LogKey::NONE)` yields the first entry so callers can bootstrap a
    /// full replication. `Ok(LogKey::NONE)` at the tail, `Err` when `key` is
    /// not stored.
    pub fn next(&self, key: LogKey) -> Result<LogKey, LogError> {
        let state = self.read();
        if key.is_none() && !state.entries.is_empty() {
            return Ok(state.key_at(0));
        }
        let pos = state.position(key).ok_or(LogError::NotFound(key))?;
        Ok(state.key_at(pos + 1))
    }

    /// Payload stored under `key`.
    pub fn get(&self, key: LogKey) -> Result<String, LogError> {
        let state = self.read();
        state
            .position(key)
            .map(|pos| state.entries[pos].payload.clone())
            .ok_or(LogError::NotFound(key))
    }

    /// Advances the commit marker to the largest stored key `<= key`.
    ///
    /// The marker only moves forward. Returns the marker as it was before the
    /// call so the caller can work out the newly committed range.
    pub fn commit(&self, key: LogKey) -> LogKey {
        let mut state = self.write();
        let previous = state.committed;
        let n = state.count_up_to(key);
        if n > 0 {
            let candidate = state.entries[n - 1].key;
            if candidate > previous {
                state.committed = candidate;
            }
        }
        previous
    }

    /// Truncates the log so that only entries with key `<= key` remain.
    ///
    /// The committed prefix is immutable: asking to cut below the commit
    /// marker fails. Returns the removed suffix in log order.
    pub fn remove(&self, key: LogKey) -> Result<Vec<LogEntry>, LogError> {
        let mut state = self.write();
        if key < state.committed {
            return Err(LogError::RemoveCommitted {
                requested: key,
                committed: state.committed,
            });
        }
        let keep = state.count_up_to(key);
        Ok(state.entries.split_off(keep))
    }

    /// Entries in the closed interval `[begin, end]`.
    ///
    /// Empty when either endpoint is not stored or `begin` sorts after `end`.
    pub fn range(&self, begin: LogKey, end: LogKey) -> Vec<LogEntry> {
        let state = self.read();
        match (state.position(begin), state.position(end)) {
            (Some(b), Some(e)) if b <= e => state.entries[b..=e].to_vec(),
            _ => Vec::new(),
        }
    }

    /// Keys in the closed interval `[begin, end]`, same rules as [`LogStore::range`].
    pub fn range_keys(&self, begin: LogKey, end: LogKey) -> Vec<LogKey> {
        let state = self.read();
        match (state.position(begin), state.position(end)) {
            (Some(b), Some(e)) if b <= e => state.entries[b..=e].iter().map(|e| e.key).collect(),
            _ => Vec::new(),
        }
    }

    /// Copy of every entry, for operator inspection.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.read().entries.clone()
    }
}
