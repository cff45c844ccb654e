//! Raft RPC message definitions.

use super::LogEntry;
use crate::codec::WireMessage;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Raft RPC messages.
///
/// Transports that multiplex all traffic over one connection frame this
/// envelope; point-to-point transports can encode the bodies directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request vote from other nodes during election.
    RequestVote(RequestVoteRequest),
    /// Response to RequestVote.
    RequestVoteResponse(RequestVoteResponse),
    /// Append entries (heartbeat or log replication).
    AppendEntries(AppendEntriesRequest),
    /// Response to AppendEntries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Install snapshot for slow followers.
    InstallSnapshot(InstallSnapshotRequest),
    /// Response to InstallSnapshot.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting vote.
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself.
    pub term: Term,
    /// True if candidate received vote.
    pub vote_granted: bool,
    /// Whether the candidate's log is at least as up-to-date as the voter's.
    pub log_ok: bool,
}

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones.
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry.
    pub prev_log_term: Term,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// On success, the last index known to match the leader. On rejection,
    /// the last index the follower believes is good.
    pub last_log_index: LogIndex,
    /// True if follower contained entry matching prev_log_index and prev_log_term.
    pub success: bool,
}

/// InstallSnapshot RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up through and including this index.
    pub last_included_index: LogIndex,
    /// Term of last_included_index.
    pub last_included_term: Term,
    /// Byte offset where chunk is positioned in the snapshot file.
    pub offset: u64,
    /// Raw bytes of the snapshot chunk.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// True if this is the last chunk.
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// Bytes of the snapshot file the follower holds; the next chunk must
    /// start at this offset.
    pub bytes_stored: u64,
}

impl WireMessage for RaftMessage {}
impl WireMessage for RequestVoteRequest {}
impl WireMessage for RequestVoteResponse {}
impl WireMessage for AppendEntriesRequest {}
impl WireMessage for AppendEntriesResponse {}
impl WireMessage for InstallSnapshotRequest {}
impl WireMessage for InstallSnapshotResponse {}

/// Trait for Raft RPC transport.
///
/// Each call is a request with a timeout applied by the caller; transports
/// report unreachable peers as errors and never retry on their own.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    /// Establish (or verify) connectivity to a peer.
    async fn connect(&self, target: NodeId) -> crate::Result<()> {
        let _ = target;
        Ok(())
    }

    /// Send RequestVote to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    /// Send InstallSnapshot to a peer.
    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> crate::Result<InstallSnapshotResponse>;
}
