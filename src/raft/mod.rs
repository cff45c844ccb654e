//! Raft consensus implementation.
//!
//! This module implements the Raft consensus algorithm for a replicated
//! state machine. It handles leader election, log replication over a
//! segmented durable log, durable metadata, and snapshot-based log
//! compaction with chunked snapshot transfer.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod committer;
mod log;
mod log_store;
pub mod metadata;
mod node;
mod peer;
pub mod rpc;
mod segment;
pub mod snapshot;
mod state;
mod timer;

pub use log::{EntryKind, LogCache, LogEntry};
pub use log_store::{LogStore, SnapshotTrigger};
pub use metadata::{MetaValue, MetadataStore, PersistentMetadata};
pub use node::{RaftNode, RaftStatus};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftMessage, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use segment::Segment;
pub use snapshot::{
    SnapshotBuilder, SnapshotHeader, SnapshotMeta, SnapshotReader, SnapshotReceiver,
    SnapshotStore, SnapshotWriter,
};
pub use state::{PeerProgress, RaftState, ReplicateCallback, ReplicateResult, Role};
pub use timer::ElectionTimer;

use crate::types::LogIndex;
use std::io::{Read, Write};

/// Application state machine driven by Raft.
///
/// All three callbacks run on the node's committer task, one at a time.
pub trait StateMachine: Send + 'static {
    /// Apply a committed entry. Called exactly once per index, in order,
    /// resuming at `last_applied + 1` after a restart.
    fn commit_entry(&mut self, payload: &[u8], index: LogIndex) -> crate::Result<()>;

    /// Write the state as of `as_of_index` (the last applied index).
    fn build_snapshot(&self, writer: &mut dyn Write, as_of_index: LogIndex) -> crate::Result<()>;

    /// Replace the state with a snapshot payload.
    fn install_snapshot(
        &mut self,
        reader: &mut dyn Read,
        last_included_index: LogIndex,
    ) -> crate::Result<()>;
}
