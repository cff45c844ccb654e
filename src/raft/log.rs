//! Raft log entries and the in-memory tail cache.

use crate::codec::WireMessage;
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Application payload handed to `commit_entry`.
    AppendLog,
    /// Cluster configuration record. Carried and replicated, never applied.
    Configuration,
}

/// A single entry in the Raft log.
///
/// Uses Arc<Vec<u8>> for the data field to enable O(1) cloning during
/// log replication, avoiding expensive data copies in the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log. Zero asks the log store to assign one.
    pub index: LogIndex,
    /// The term when the entry was received.
    pub term: Term,
    /// Entry kind.
    pub kind: EntryKind,
    /// The command data.
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new application entry.
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::AppendLog,
            data: Arc::new(data),
        }
    }

    /// Create an entry of the given kind with pre-wrapped data.
    pub fn with_kind(term: Term, index: LogIndex, kind: EntryKind, data: Arc<Vec<u8>>) -> Self {
        Self { index, term, kind, data }
    }

    /// Get a reference to the data bytes.
    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Approximate in-memory footprint, used for the cache budget.
    pub fn footprint(&self) -> usize {
        self.data.len() + std::mem::size_of::<Self>()
    }
}

impl WireMessage for LogEntry {}

/// Serde helper module for Arc<Vec<u8>> serialization.
/// Serializes as raw bytes, deserializes into Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Check if a candidate's log is at least as up-to-date as ours.
pub fn is_up_to_date(
    our_last_index: LogIndex,
    our_last_term: Term,
    their_last_index: LogIndex,
    their_last_term: Term,
) -> bool {
    if their_last_term != our_last_term {
        their_last_term > our_last_term
    } else {
        their_last_index >= our_last_index
    }
}

/// Contiguous run of the most recent entries, bounded by a byte budget.
///
/// Evicts oldest-first. A push that does not extend the run replaces it.
#[derive(Debug)]
pub struct LogCache {
    entries: VecDeque<LogEntry>,
    bytes: usize,
    max_bytes: usize,
}

impl LogCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted to cached entries.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn first_index(&self) -> Option<LogIndex> {
        self.entries.front().map(|e| e.index)
    }

    /// Append the newest entry.
    pub fn push(&mut self, entry: LogEntry) {
        let extends = self
            .entries
            .back()
            .map(|last| last.index + 1 == entry.index)
            .unwrap_or(true);
        if !extends {
            self.clear();
        }

        self.bytes += entry.footprint();
        self.entries.push_back(entry);

        while self.bytes > self.max_bytes {
            match self.entries.pop_front() {
                Some(evicted) => self.bytes -= evicted.footprint(),
                None => break,
            }
        }
    }

    /// Look up an entry by index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let first = self.first_index()?;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Drop every entry with index >= `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        while let Some(last) = self.entries.back() {
            if last.index < index {
                break;
            }
            if let Some(removed) = self.entries.pop_back() {
                self.bytes -= removed.footprint();
            }
        }
    }

    /// Drop every entry with index <= `index`.
    pub fn truncate_through(&mut self, index: LogIndex) {
        while let Some(first) = self.entries.front() {
            if first.index > index {
                break;
            }
            if let Some(removed) = self.entries.pop_front() {
                self.bytes -= removed.footprint();
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}
