//! Raft node state management.
//!
//! [`RaftState`] holds every piece of mutable consensus state. The node keeps
//! it behind a single mutex; nothing here performs I/O.

use super::metadata::PersistentMetadata;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::task::AbortHandle;

/// The role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Follower state - passive, responds to RPCs.
    Follower,
    /// Candidate state - actively seeking election.
    Candidate,
    /// Leader state - handling client requests and replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Leader-side replication progress for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Index of the next log entry to send.
    pub next_index: LogIndex,
    /// Index of highest log entry known to be replicated.
    pub match_index: LogIndex,
}

/// Outcome delivered to a `replicate` caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateResult {
    pub success: bool,
    pub index: LogIndex,
}

impl ReplicateResult {
    pub fn committed(index: LogIndex) -> Self {
        Self { success: true, index }
    }

    pub fn failed() -> Self {
        Self { success: false, index: 0 }
    }
}

/// Completion callback of a `replicate` call. Always run on the committer.
pub type ReplicateCallback = Box<dyn FnOnce(ReplicateResult) + Send>;

/// Why a node stopped accepting `replicate` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Shutdown,
    /// Durable state could not be written; applying further entries could
    /// deliver one twice.
    DurabilityFailure,
}

/// A `replicate` call waiting for its entry to be applied.
pub struct PendingReplication {
    /// Term the entry was appended in.
    pub term: Term,
    /// Deadline task; aborted when the call resolves.
    pub timeout: Option<AbortHandle>,
    pub callback: ReplicateCallback,
}

impl PendingReplication {
    /// Resolve the call, cancelling its deadline.
    pub fn resolve(self, result: ReplicateResult) -> (ReplicateCallback, ReplicateResult) {
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        (self.callback, result)
    }
}

impl std::fmt::Debug for PendingReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplication")
            .field("term", &self.term)
            .finish()
    }
}

/// Complete Raft state for a node.
#[derive(Debug)]
pub struct RaftState {
    /// This node's ID.
    pub node_id: NodeId,
    /// Peer node IDs.
    pub peers: Vec<NodeId>,
    /// Current role.
    pub role: Role,
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<NodeId>,
    /// Current leader ID (if known).
    pub leader_id: Option<NodeId>,
    /// Index of highest log entry known to be committed.
    pub committed_index: LogIndex,
    /// Index of highest log entry applied to state machine.
    pub last_applied: LogIndex,
    /// Boundary of the newest snapshot.
    pub last_snapshot_index: LogIndex,
    pub last_snapshot_term: Term,
    /// Votes received as candidate, self included.
    pub votes: HashSet<NodeId>,
    /// Per-peer progress (leader only).
    pub progress: HashMap<NodeId, PeerProgress>,
    /// Outstanding `replicate` calls by log index.
    pub pending: BTreeMap<LogIndex, PendingReplication>,
    /// Set once the committer is stopping. No new `replicate` call is
    /// accepted afterwards.
    pub halted: Option<HaltReason>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            peers,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            committed_index: 0,
            last_applied: 0,
            last_snapshot_index: 0,
            last_snapshot_term: 0,
            votes: HashSet::new(),
            progress: HashMap::new(),
            pending: BTreeMap::new(),
            halted: None,
        }
    }

    /// Restore the durable facts loaded at startup.
    pub fn restore(&mut self, persisted: &PersistentMetadata) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.leader_id = persisted.leader_id;
        self.committed_index = persisted.committed_index;
        self.last_applied = persisted.last_applied_index;
        self.last_snapshot_index = persisted.last_snapshot_index;
        self.last_snapshot_term = persisted.last_snapshot_term;
    }

    /// Transition to follower state.
    ///
    /// A newer term clears the vote. Callers persist the change first.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.progress.clear();

        tracing::info!(
            node_id = self.node_id,
            term = self.current_term,
            leader = ?leader_id,
            "Became follower"
        );
    }

    /// Transition to candidate state in the next term, voting for self.
    pub fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.progress.clear();
        self.votes.clear();
        self.votes.insert(self.node_id);

        tracing::info!(
            node_id = self.node_id,
            term = self.current_term,
            "Became candidate"
        );
    }

    /// Transition to leader state.
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id);
        self.votes.clear();
        self.progress = self
            .peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    PeerProgress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();

        tracing::info!(
            node_id = self.node_id,
            term = self.current_term,
            "Became leader"
        );
    }

    /// Check if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Get the quorum size for this cluster.
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Record a granted vote. Returns true once the votes form a majority.
    pub fn record_vote(&mut self, voter: NodeId) -> bool {
        if self.role.is_candidate() {
            self.votes.insert(voter);
        }
        self.role.is_candidate() && self.votes.len() >= self.quorum_size()
    }

    /// Record a successful append on `peer` up to `match_index`.
    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.match_index + 1;
        }
    }

    /// Back off `next_index` after a rejection.
    ///
    /// Jumps to just past the follower's reported last good index when that
    /// is lower than a plain decrement.
    pub fn backoff(&mut self, peer: NodeId, follower_last_good: LogIndex) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            let decremented = progress.next_index.saturating_sub(1);
            progress.next_index = decremented.min(follower_last_good + 1).max(1);
        }
    }

    /// Highest index a majority holds whose entry is from the current term.
    ///
    /// `term_at` resolves the term of a log index. Returns `None` when the
    /// commit index cannot advance.
    pub fn calculate_commit_index<F>(&self, last_log_index: LogIndex, term_at: F) -> Option<LogIndex>
    where
        F: Fn(LogIndex) -> Option<Term>,
    {
        if !self.is_leader() {
            return None;
        }

        // Find the highest index that a majority of servers have
        let mut indices: Vec<LogIndex> = self.progress.values().map(|p| p.match_index).collect();
        indices.push(last_log_index); // Include leader's own index
        indices.sort_unstable_by(|a, b| b.cmp(a));

        // The index at position quorum_size - 1 is the highest index
        // that at least quorum_size servers have
        let candidate = *indices.get(self.quorum_size() - 1)?;
        if candidate <= self.committed_index {
            return None;
        }

        // Entries from earlier terms only commit underneath a current-term entry.
        if term_at(candidate) == Some(self.current_term) {
            Some(candidate)
        } else {
            None
        }
    }
}
