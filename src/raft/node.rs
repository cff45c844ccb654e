//! Raft node implementation.
//!
//! [`Core`] owns all consensus state behind one mutex. RPC handlers, the
//! election timer, and the peer agents take that lock briefly and never
//! hold it across an await. Lock order is state first, then the log,
//! metadata, or snapshot receiver. The state machine lock is only taken by
//! the committer and [`RaftNode::with_state_machine`], never under the state
//! lock.

use super::committer::{self, CommitterTask};
use super::log::{is_up_to_date, LogEntry};
use super::log_store::LogStore;
use super::metadata::{keys, MetadataStore, PersistentMetadata};
use super::peer::{
    AgentSettings, PeerCommand, PeerHandle, ReplicationContext, ReplicationPlan, SnapshotPlan,
};
use super::rpc::*;
use super::snapshot::{ReceiveOutcome, SnapshotBuilder, SnapshotReader, SnapshotReceiver, SnapshotStore};
use super::state::{HaltReason, RaftState, ReplicateCallback, ReplicateResult, Role};
use super::timer::ElectionTimer;
use super::StateMachine;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::observability;
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub committed_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_snapshot_index: LogIndex,
}

pub(crate) struct Core<S: StateMachine> {
    pub(super) id: NodeId,
    pub(super) config: RaftConfig,
    pub(super) state: Mutex<RaftState>,
    pub(super) log: LogStore,
    pub(super) metadata: MetadataStore,
    pub(super) snapshots: SnapshotStore,
    pub(super) builder: SnapshotBuilder,
    pub(super) receiver: Mutex<SnapshotReceiver>,
    pub(super) state_machine: Mutex<S>,
    pub(super) committer_tx: mpsc::UnboundedSender<CommitterTask>,
    runtime: Handle,
    peers: OnceLock<HashMap<NodeId, PeerHandle>>,
    timer: OnceLock<ElectionTimer>,
}

impl<S: StateMachine> Core<S> {
    fn broadcast(&self, command: PeerCommand) {
        for handle in self.peers.get().into_iter().flat_map(|peers| peers.values()) {
            handle.send(command);
        }
    }

    fn wake_peers(&self) {
        for handle in self.peers.get().into_iter().flat_map(|peers| peers.values()) {
            handle.wake();
        }
    }

    fn reset_timer(&self) {
        if let Some(timer) = self.timer.get() {
            timer.reset();
        }
    }

    /// Queue callbacks for delivery on the committer.
    ///
    /// Once the committer has stopped nothing is pending any more, so the
    /// only callers left are immediate rejections made outside the state
    /// lock; those callbacks run inline.
    fn resolve_later(&self, resolved: Vec<(ReplicateCallback, ReplicateResult)>) {
        if resolved.is_empty() {
            return;
        }
        if let Err(mpsc::error::SendError(CommitterTask::Resolve(resolved))) =
            self.committer_tx.send(CommitterTask::Resolve(resolved))
        {
            for (callback, result) in resolved {
                callback(result);
            }
        }
    }

    /// Refuse further `replicate` calls and fail every pending one.
    pub(super) fn halt(&self, reason: HaltReason) {
        let pending = {
            let mut state = self.state.lock();
            state.halted.get_or_insert(reason);
            std::mem::take(&mut state.pending)
        };
        for pending in pending.into_values() {
            let (callback, result) = pending.resolve(ReplicateResult::failed());
            callback(result);
        }
    }

    /// Index and term of the last entry, falling back to the snapshot
    /// boundary when the log holds nothing past it.
    fn last_log_info(&self, state: &RaftState) -> Result<(LogIndex, Term)> {
        let last = self.log.last_index();
        if last == 0 {
            return Ok((0, 0));
        }
        if last == state.last_snapshot_index {
            return Ok((last, state.last_snapshot_term));
        }
        match self.log.term_at(last)? {
            Some(term) => Ok((last, term)),
            None => Ok((state.last_snapshot_index, state.last_snapshot_term)),
        }
    }

    /// Step down to follower in `term`, recognising `leader` if known.
    fn step_down(&self, state: &mut RaftState, term: Term, leader: Option<NodeId>) -> Result<()> {
        let previous = state.role;
        let newer = term > state.current_term;
        if newer {
            self.metadata.set_u64(keys::CURRENT_TERM, term)?;
            self.metadata.set_node(keys::VOTED_FOR, None)?;
        }
        if state.leader_id != leader {
            self.metadata.set_node(keys::LEADER_ID, leader)?;
        }
        state.become_follower(term, leader);

        if newer {
            if let Err(e) = self.receiver.lock().discard() {
                warn!(node_id = self.id, error = %e, "Failed to discard incoming snapshot");
            }
        }
        if previous != Role::Follower {
            self.broadcast(PeerCommand::Sleep);
        }
        self.reset_timer();
        observability::update_raft_metrics(term, state.committed_index, state.last_applied);
        Ok(())
    }

    fn become_leader(&self, state: &mut RaftState) -> Result<()> {
        let (last_index, _) = self.last_log_info(state)?;
        self.metadata.set_node(keys::LEADER_ID, Some(self.id))?;
        state.become_leader(last_index);
        if let Some(timer) = self.timer.get() {
            timer.cancel();
        }
        self.broadcast(PeerCommand::AppendEntries);
        Ok(())
    }

    /// Advance the leader's commit index to the highest majority-held
    /// current-term entry.
    fn advance_commit(&self, state: &mut RaftState) -> Result<()> {
        let log = &self.log;
        let id = self.id;
        let committed = state.calculate_commit_index(log.last_index(), |index| {
            log.term_at(index).unwrap_or_else(|e| {
                warn!(node_id = id, index, error = %e, "Failed to read term for commit check");
                None
            })
        });
        if let Some(index) = committed {
            self.metadata.set_u64(keys::COMMITTED_INDEX, index)?;
            state.committed_index = index;
            debug!(node_id = self.id, commit_index = index, "Advanced commit index");
            let _ = self.committer_tx.send(CommitterTask::Apply { up_to: None });
            self.wake_peers();
        }
        Ok(())
    }

    /// Drop entries from `index` on, failing their pending callbacks.
    fn truncate_log_suffix(&self, state: &mut RaftState, index: LogIndex) -> Result<()> {
        if index <= state.committed_index {
            return Err(RaftError::CommittedTruncation {
                index,
                committed: state.committed_index,
            });
        }
        self.log.truncate_suffix(index)?;
        let doomed = state.pending.split_off(&index);
        let resolved = doomed
            .into_values()
            .map(|pending| pending.resolve(ReplicateResult::failed()))
            .collect();
        self.resolve_later(resolved);
        debug!(node_id = self.id, index, "Truncated conflicting log suffix");
        Ok(())
    }

    fn on_election_timeout(&self, generation: u64) {
        let mut state = self.state.lock();
        let timer = match self.timer.get() {
            Some(timer) => timer,
            None => return,
        };
        if !timer.is_current(generation) || state.is_leader() {
            return;
        }

        let term = state.current_term + 1;
        let persisted = self
            .metadata
            .set_u64(keys::CURRENT_TERM, term)
            .and_then(|_| self.metadata.set_node(keys::VOTED_FOR, Some(self.id)))
            .and_then(|_| self.metadata.set_node(keys::LEADER_ID, None));
        if let Err(e) = persisted {
            error!(node_id = self.id, error = %e, "Failed to persist candidacy");
            timer.reset();
            return;
        }

        state.become_candidate();
        observability::record_election();
        info!(node_id = self.id, term, "Starting election");
        timer.reset();

        if state.record_vote(self.id) {
            if let Err(e) = self.become_leader(&mut state) {
                error!(node_id = self.id, error = %e, "Failed to become leader");
            }
        } else {
            self.broadcast(PeerCommand::Election);
        }
    }

    /// Append a new entry as leader and track it until applied.
    fn replicate(&self, data: Vec<u8>, callback: ReplicateCallback) -> Result<LogIndex> {
        let mut state = self.state.lock();
        if let Some(reason) = state.halted {
            drop(state);
            self.resolve_later(vec![(callback, ReplicateResult::failed())]);
            return Err(match reason {
                HaltReason::Shutdown => RaftError::Shutdown,
                HaltReason::DurabilityFailure => RaftError::Storage(
                    "committer stopped after a durability failure".into(),
                ),
            });
        }
        if !state.is_leader() {
            let leader = state.leader_id;
            drop(state);
            self.resolve_later(vec![(callback, ReplicateResult::failed())]);
            return Err(RaftError::NotLeader { leader });
        }

        let term = state.current_term;
        let index = match self.log.write(LogEntry::new(term, 0, data)) {
            Ok(index) => index,
            Err(e) => {
                drop(state);
                error!(node_id = self.id, error = %e, "Failed to append entry");
                self.resolve_later(vec![(callback, ReplicateResult::failed())]);
                return Err(e);
            }
        };

        let tx = self.committer_tx.clone();
        let deadline = self.config.replicate_timeout;
        let timeout = self
            .runtime
            .spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(CommitterTask::Timeout { index, term });
            })
            .abort_handle();
        state.pending.insert(
            index,
            super::state::PendingReplication {
                term,
                timeout: Some(timeout),
                callback,
            },
        );
        observability::record_proposal();

        self.advance_commit(&mut state)?;
        drop(state);
        self.wake_peers();
        Ok(index)
    }

    fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut state = self.state.lock();
        if request.term > state.current_term {
            self.step_down(&mut state, request.term, None)?;
        }

        let (last_index, last_term) = self.last_log_info(&state)?;
        let log_ok = is_up_to_date(
            last_index,
            last_term,
            request.last_log_index,
            request.last_log_term,
        );
        let can_vote = state.voted_for.is_none() || state.voted_for == Some(request.candidate_id);
        let vote_granted = request.term == state.current_term && can_vote && log_ok;

        if vote_granted {
            self.metadata
                .set_node(keys::VOTED_FOR, Some(request.candidate_id))?;
            state.voted_for = Some(request.candidate_id);
            self.reset_timer();
        }

        debug!(
            node_id = self.id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            log_ok,
            "Handled RequestVote"
        );

        Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted,
            log_ok,
        })
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut state = self.state.lock();

        if request.term < state.current_term {
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                last_log_index: self.log.last_index(),
                success: false,
            });
        }

        if request.term > state.current_term
            || !state.role.is_follower()
            || state.leader_id != Some(request.leader_id)
        {
            self.step_down(&mut state, request.term, Some(request.leader_id))?;
        } else {
            self.reset_timer();
        }

        let prev = request.prev_log_index;
        let snapshot_index = state.last_snapshot_index;
        let matched = if prev == 0 || prev < snapshot_index {
            // Everything up to the snapshot boundary is committed.
            true
        } else if prev == snapshot_index {
            request.prev_log_term == state.last_snapshot_term
        } else {
            self.log.term_at(prev)? == Some(request.prev_log_term)
        };

        if !matched {
            let last_good = (prev - 1).min(self.log.last_index());
            debug!(
                node_id = self.id,
                prev_log_index = prev,
                last_good,
                "Rejected AppendEntries"
            );
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                last_log_index: last_good,
                success: false,
            });
        }

        let mut append_from = None;
        for (i, entry) in request.entries.iter().enumerate() {
            if entry.index <= snapshot_index {
                continue;
            }
            match self.log.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_log_suffix(&mut state, entry.index)?;
                    append_from = Some(i);
                    break;
                }
                None => {
                    append_from = Some(i);
                    break;
                }
            }
        }
        if let Some(start) = append_from {
            for entry in &request.entries[start..] {
                self.log.write(entry.clone())?;
            }
        }

        let verified = (prev + request.entries.len() as u64).max(snapshot_index);
        let up_to = request.leader_commit.min(verified);
        if up_to > state.committed_index {
            let _ = self
                .committer_tx
                .send(CommitterTask::Apply { up_to: Some(up_to) });
        }

        Ok(AppendEntriesResponse {
            term: state.current_term,
            last_log_index: verified,
            success: true,
        })
    }

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let term = {
            let mut state = self.state.lock();
            if request.term < state.current_term {
                return Ok(InstallSnapshotResponse {
                    term: state.current_term,
                    bytes_stored: 0,
                });
            }
            if request.term > state.current_term
                || !state.role.is_follower()
                || state.leader_id != Some(request.leader_id)
            {
                self.step_down(&mut state, request.term, Some(request.leader_id))?;
            } else {
                self.reset_timer();
            }
            state.current_term
        };

        let outcome = self.receiver.lock().receive(&request)?;
        let bytes_stored = match outcome {
            ReceiveOutcome::Stored { bytes_stored } => bytes_stored,
            ReceiveOutcome::Rejected => 0,
            ReceiveOutcome::Complete { meta } => {
                let size = meta.size;
                let (reply, installed) = oneshot::channel();
                self.committer_tx
                    .send(CommitterTask::InstallSnapshot { meta, reply })
                    .map_err(|_| RaftError::Shutdown)?;
                installed.await.map_err(|_| RaftError::Shutdown)??;
                size
            }
        };

        Ok(InstallSnapshotResponse { term, bytes_stored })
    }

    fn status(&self) -> RaftStatus {
        let state = self.state.lock();
        RaftStatus {
            node_id: self.id,
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            committed_index: state.committed_index,
            last_applied: state.last_applied,
            last_log_index: self.log.last_index(),
            last_snapshot_index: state.last_snapshot_index,
        }
    }
}

impl<S: StateMachine> ReplicationContext for Core<S> {
    fn vote_request(&self) -> Option<RequestVoteRequest> {
        let state = self.state.lock();
        if !state.role.is_candidate() {
            return None;
        }
        let (last_log_index, last_log_term) = match self.last_log_info(&state) {
            Ok(info) => info,
            Err(e) => {
                error!(node_id = self.id, error = %e, "Failed to read last log entry");
                return None;
            }
        };
        Some(RequestVoteRequest {
            term: state.current_term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        })
    }

    fn handle_vote_response(
        &self,
        peer: NodeId,
        request: &RequestVoteRequest,
        response: RequestVoteResponse,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if response.term > state.current_term {
            return self.step_down(&mut state, response.term, None);
        }
        if !state.role.is_candidate() || state.current_term != request.term {
            return Ok(());
        }

        debug!(
            node_id = self.id,
            peer,
            term = request.term,
            granted = response.vote_granted,
            "Received vote"
        );
        if response.vote_granted && state.record_vote(peer) {
            self.become_leader(&mut state)?;
        }
        Ok(())
    }

    fn plan_replication(&self, peer: NodeId) -> Result<ReplicationPlan> {
        let state = self.state.lock();
        if !state.is_leader() {
            return Ok(ReplicationPlan::NotLeader);
        }
        let next_index = match state.progress.get(&peer) {
            Some(progress) => progress.next_index,
            None => return Ok(ReplicationPlan::NotLeader),
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index == 0 {
            Some(0)
        } else if prev_log_index == state.last_snapshot_index {
            Some(state.last_snapshot_term)
        } else {
            self.log.term_at(prev_log_index)?
        };

        let prev_log_term = match prev_log_term {
            Some(term) if next_index >= self.log.start_index() => term,
            _ => {
                // The entries this peer needs were compacted away.
                let meta = self.snapshots.latest()?.ok_or_else(|| {
                    RaftError::SnapshotNotFound(format!("needed for peer {}", peer))
                })?;
                return Ok(ReplicationPlan::Snapshot(SnapshotPlan {
                    term: state.current_term,
                    leader_id: self.id,
                    meta,
                }));
            }
        };

        let entries = self
            .log
            .get_entries(next_index, self.config.max_entries_per_append)?;
        Ok(ReplicationPlan::Append(AppendEntriesRequest {
            term: state.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            leader_commit: state.committed_index,
            entries,
        }))
    }

    fn handle_append_response(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if response.term > state.current_term {
            self.step_down(&mut state, response.term, None)?;
            return Ok(false);
        }
        if !state.is_leader() || state.current_term != request.term {
            return Ok(false);
        }

        if response.success {
            state.update_match(peer, response.last_log_index);
            self.advance_commit(&mut state)?;
        } else {
            state.backoff(peer, response.last_log_index);
            debug!(
                node_id = self.id,
                peer,
                follower_last = response.last_log_index,
                "Peer rejected AppendEntries"
            );
        }
        Ok(true)
    }

    fn handle_snapshot_response(
        &self,
        _peer: NodeId,
        term: Term,
        response: &InstallSnapshotResponse,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if response.term > state.current_term {
            self.step_down(&mut state, response.term, None)?;
            return Ok(false);
        }
        Ok(state.is_leader() && state.current_term == term)
    }

    fn snapshot_sent(&self, peer: NodeId, last_included_index: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_leader() {
            state.update_match(peer, last_included_index);
            self.advance_commit(&mut state)?;
        }
        Ok(())
    }
}

/// A running Raft node.
///
/// Every method is safe to call concurrently. Transports route incoming
/// RPCs to the `handle_*` methods.
pub struct RaftNode<S: StateMachine> {
    core: Arc<Core<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Open durable state, restore the state machine, and start the
    /// election timer, peer agents, and committer.
    pub async fn start(config: RaftConfig, state_machine: S, rpc: Arc<dyn RaftRpc>) -> Result<Self> {
        config.validate()?;
        let id = config.node.id;

        let metadata = MetadataStore::open(&config.storage.metadata_dir, &config.metadata)?;
        let log = LogStore::open(&config.storage.log_dir, &config.log)?;
        let snapshots = SnapshotStore::open(&config.storage.snapshot_dir)?;

        let mut state = RaftState::new(id, config.peer_ids());
        state.restore(&PersistentMetadata::load(&metadata));
        let mut state_machine = state_machine;

        // A crash can leave a newer snapshot on disk than the metadata records.
        if let Some(meta) = snapshots.latest()? {
            if meta.last_included_index > state.last_applied {
                let mut reader = SnapshotReader::open(&meta.path)?;
                state_machine.install_snapshot(&mut reader, meta.last_included_index)?;
                state.last_applied = meta.last_included_index;
                metadata.set_u64(keys::LAST_APPLIED_INDEX, state.last_applied)?;
                info!(node_id = id, index = meta.last_included_index, "Restored snapshot");
            }
            if meta.last_included_index > state.last_snapshot_index {
                state.last_snapshot_index = meta.last_included_index;
                state.last_snapshot_term = meta.last_included_term;
                metadata.set_u64(keys::LAST_SNAPSHOT_INDEX, meta.last_included_index)?;
                metadata.set_u64(keys::LAST_SNAPSHOT_TERM, meta.last_included_term)?;
            }
        }

        // Line the log up behind the snapshot boundary.
        let boundary = state.last_snapshot_index;
        if boundary > 0 {
            match log.term_at(boundary)? {
                Some(term) if term == state.last_snapshot_term => log.truncate_prefix(boundary)?,
                Some(_) => log.reset(boundary)?,
                None if log.last_index() < boundary || log.start_index() > boundary + 1 => {
                    log.reset(boundary)?
                }
                None => {}
            }
        }

        let durable_end = log.last_index().max(state.last_snapshot_index);
        state.committed_index = state
            .committed_index
            .max(state.last_applied)
            .min(durable_end);

        let (committer_tx, committer_rx) = mpsc::unbounded_channel();
        let settings = AgentSettings {
            heartbeat_interval: config.heartbeat_interval,
            rpc_timeout: config.rpc_timeout,
            snapshot_chunk_size: config.snapshot_chunk_size,
        };
        let election_timeout = config.election_timeout;
        let builder = SnapshotBuilder::new(config.snapshot.distance);
        let receiver = SnapshotReceiver::new(&config.storage.snapshot_dir);
        observability::update_raft_metrics(
            state.current_term,
            state.committed_index,
            state.last_applied,
        );
        let term = state.current_term;

        let core = Arc::new(Core {
            id,
            config,
            state: Mutex::new(state),
            log,
            metadata,
            snapshots,
            builder,
            receiver: Mutex::new(receiver),
            state_machine: Mutex::new(state_machine),
            committer_tx: committer_tx.clone(),
            runtime: Handle::current(),
            peers: OnceLock::new(),
            timer: OnceLock::new(),
        });

        core.log.set_snapshot_trigger(Arc::new(move || {
            let _ = committer_tx.send(CommitterTask::BuildSnapshot { requested: true });
        }));

        let weak = Arc::downgrade(&core);
        let timer = ElectionTimer::spawn(election_timeout, move |generation| {
            if let Some(core) = weak.upgrade() {
                core.on_election_timeout(generation);
            }
        });
        let _ = core.timer.set(timer);

        let mut tasks = Vec::new();
        let mut peers = HashMap::new();
        for peer in core.config.peer_ids() {
            let (handle, task) =
                PeerHandle::spawn(peer, Arc::clone(&core), Arc::clone(&rpc), settings);
            peers.insert(peer, handle);
            tasks.push(task);
        }
        let _ = core.peers.set(peers);
        tasks.push(tokio::spawn(committer::run(Arc::clone(&core), committer_rx)));

        core.broadcast(PeerCommand::Connect);
        core.reset_timer();
        let _ = core.committer_tx.send(CommitterTask::Apply { up_to: None });

        info!(
            node_id = id,
            term,
            peers = core.config.peers.len(),
            "Raft node started"
        );

        Ok(Self {
            core,
            tasks: Mutex::new(tasks),
        })
    }

    /// Replicate `data` as a new log entry.
    ///
    /// Returns the assigned index once the entry is in the leader's log.
    /// `callback` runs exactly once: with success after the entry is
    /// applied locally, or with failure on lost leadership, truncation, or
    /// the replicate deadline.
    pub fn replicate<F>(&self, data: Vec<u8>, callback: F) -> Result<LogIndex>
    where
        F: FnOnce(ReplicateResult) + Send + 'static,
    {
        self.core.replicate(data, Box::new(callback))
    }

    /// Replicate `data` and wait until it is applied.
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        let (tx, rx) = oneshot::channel();
        let index = self.core.replicate(
            data,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        let result = rx.await.map_err(|_| RaftError::Shutdown)?;
        if result.success {
            Ok(index)
        } else {
            Err(RaftError::NotCommitted { index })
        }
    }

    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.core.handle_request_vote(request)
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.core.handle_append_entries(request)
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.core.handle_install_snapshot(request).await
    }

    /// Dispatch a request envelope, returning the matching response.
    pub async fn handle_message(&self, message: RaftMessage) -> Result<RaftMessage> {
        match message {
            RaftMessage::RequestVote(request) => self
                .handle_request_vote(request)
                .await
                .map(RaftMessage::RequestVoteResponse),
            RaftMessage::AppendEntries(request) => self
                .handle_append_entries(request)
                .await
                .map(RaftMessage::AppendEntriesResponse),
            RaftMessage::InstallSnapshot(request) => self
                .handle_install_snapshot(request)
                .await
                .map(RaftMessage::InstallSnapshotResponse),
            _ => Err(RaftError::Internal("expected a request message".into())),
        }
    }

    pub fn status(&self) -> RaftStatus {
        self.core.status()
    }

    pub fn node_id(&self) -> NodeId {
        self.core.id
    }

    pub fn is_leader(&self) -> bool {
        self.core.state.lock().is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.core.state.lock().leader_id
    }

    /// Read up to `count` entries starting at `start`.
    pub fn read_log_entries(&self, start: LogIndex, count: usize) -> Result<Vec<LogEntry>> {
        self.core.log.get_entries(start, count)
    }

    /// Run `f` against the state machine.
    pub fn with_state_machine<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.core.state_machine.lock())
    }

    /// Build a snapshot now if anything was applied since the last one.
    pub fn request_snapshot(&self) -> Result<()> {
        self.core
            .committer_tx
            .send(CommitterTask::BuildSnapshot { requested: true })
            .map_err(|_| RaftError::Shutdown)
    }

    /// Stop all tasks. Outstanding `replicate` calls fail.
    pub async fn shutdown(&self) {
        info!(node_id = self.core.id, "Shutting down Raft node");
        self.core.broadcast(PeerCommand::Exit);
        if let Some(timer) = self.core.timer.get() {
            timer.stop();
        }
        self.core.halt(HaltReason::Shutdown);
        let _ = self.core.committer_tx.send(CommitterTask::Shutdown);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                warn!(node_id = self.core.id, error = %e, "Task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        applied: Vec<(LogIndex, Vec<u8>)>,
        /// Switched on once the given index is delivered.
        trip: Option<(LogIndex, Arc<AtomicBool>)>,
    }

    impl StateMachine for Recorder {
        fn commit_entry(&mut self, payload: &[u8], index: LogIndex) -> Result<()> {
            self.applied.push((index, payload.to_vec()));
            if let Some((at, switch)) = &self.trip {
                if *at == index {
                    switch.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }

        fn build_snapshot(&self, writer: &mut dyn Write, _as_of_index: LogIndex) -> Result<()> {
            writer.write_all(&bincode::serialize(&self.applied)?)?;
            Ok(())
        }

        fn install_snapshot(&mut self, reader: &mut dyn Read, _last: LogIndex) -> Result<()> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            self.applied = bincode::deserialize(&buf)?;
            Ok(())
        }
    }

    /// Transport with no reachable peers.
    struct Unreachable;

    #[async_trait]
    impl RaftRpc for Unreachable {
        async fn request_vote(
            &self,
            target: NodeId,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse> {
            Err(RaftError::NodeNotFound(target))
        }

        async fn append_entries(
            &self,
            target: NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Err(RaftError::NodeNotFound(target))
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            _request: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse> {
            Err(RaftError::NodeNotFound(target))
        }
    }

    fn config(dir: &std::path::Path, peers: &[NodeId]) -> RaftConfig {
        let mut config = RaftConfig::development(1, dir);
        config.election_timeout = Duration::from_millis(50);
        config.heartbeat_interval = Duration::from_millis(10);
        config.replicate_timeout = Duration::from_millis(300);
        config.peers = peers
            .iter()
            .map(|&id| crate::config::PeerConfig {
                id,
                address: "127.0.0.1".into(),
                port: 7000 + id as u16,
            })
            .collect();
        config
    }

    async fn wait_for_leader<S: StateMachine>(node: &RaftNode<S>) {
        for _ in 0..100 {
            if node.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_applies() {
        let dir = tempdir().unwrap();
        let node = RaftNode::start(config(dir.path(), &[]), Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();
        wait_for_leader(&node).await;

        let first = node.propose(b"a".to_vec()).await.unwrap();
        let second = node.propose(b"b".to_vec()).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let status = node.status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.committed_index, 2);
        assert_eq!(status.last_applied, 2);
        node.with_state_machine(|sm| {
            assert_eq!(sm.applied, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        });
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_replicate() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), &[2, 3]);
        cfg.election_timeout = Duration::from_secs(30);
        let node = RaftNode::start(cfg, Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let err = node
            .replicate(b"x".to_vec(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
        assert!(!rx.await.unwrap().success);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_entries_rules() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), &[2, 3]);
        cfg.election_timeout = Duration::from_secs(30);
        let node = RaftNode::start(cfg, Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();

        let entries = (1..=3).map(|i| LogEntry::new(1, i, vec![i as u8])).collect();
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.last_log_index, 3);
        assert_eq!(node.leader_id(), Some(2));

        // Gap: the follower reports its own last index.
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 7,
                prev_log_term: 1,
                leader_commit: 0,
                entries: Vec::new(),
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.last_log_index, 3);

        // Term mismatch at prev: the follower points just below it.
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 3,
                prev_log_index: 3,
                prev_log_term: 2,
                leader_commit: 0,
                entries: Vec::new(),
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.last_log_index, 2);
        assert_eq!(node.status().term, 2);

        // Conflicting suffix replaced, commit applied.
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 3,
                prev_log_index: 2,
                prev_log_term: 1,
                leader_commit: 3,
                entries: vec![LogEntry::new(2, 3, b"new".to_vec())],
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.last_log_index, 3);
        assert_eq!(node.read_log_entries(3, 1).unwrap()[0].term, 2);

        for _ in 0..100 {
            if node.status().last_applied == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        node.with_state_machine(|sm| {
            assert_eq!(sm.applied.last(), Some(&(3, b"new".to_vec())));
        });

        // Stale term rejected outright.
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 3,
                prev_log_term: 2,
                leader_commit: 3,
                entries: Vec::new(),
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.term, 2);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_vote_rules() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), &[2, 3]);
        cfg.election_timeout = Duration::from_secs(30);
        let node = RaftNode::start(cfg, Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();

        node.handle_append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![LogEntry::new(2, 1, vec![1]), LogEntry::new(2, 2, vec![2])],
        })
        .await
        .unwrap();

        // Shorter log in the same last term.
        let response = node
            .handle_request_vote(RequestVoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        assert!(!response.log_ok);
        assert_eq!(response.term, 3);

        let response = node
            .handle_request_vote(RequestVoteRequest {
                term: 3,
                candidate_id: 3,
                last_log_index: 2,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);

        // One vote per term, repeatable for the same candidate.
        let response = node
            .handle_request_vote(RequestVoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 5,
                last_log_term: 3,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        assert!(response.log_ok);

        let response = node
            .handle_request_vote(RequestVoteRequest {
                term: 3,
                candidate_id: 3,
                last_log_index: 2,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_restores_durable_state() {
        let dir = tempdir().unwrap();
        {
            let node =
                RaftNode::start(config(dir.path(), &[]), Recorder::default(), Arc::new(Unreachable))
                    .await
                    .unwrap();
            wait_for_leader(&node).await;
            for i in 0..5u8 {
                node.propose(vec![i]).await.unwrap();
            }
            node.request_snapshot().unwrap();
            for _ in 0..100 {
                if node.status().last_snapshot_index == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(node.status().last_snapshot_index, 5);
            node.propose(vec![5]).await.unwrap();
            node.shutdown().await;
        }

        let node = RaftNode::start(config(dir.path(), &[]), Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();
        let status = node.status();
        assert_eq!(status.last_snapshot_index, 5);
        assert_eq!(status.last_log_index, 6);
        assert_eq!(status.last_applied, 6);
        assert!(status.term >= 1);

        // Delivery resumes after the durable applied index.
        wait_for_leader(&node).await;
        assert_eq!(node.propose(vec![6]).await.unwrap(), 7);
        node.with_state_machine(|sm| {
            assert_eq!(sm.applied, vec![(7, vec![6])]);
        });
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_apply_persist_halts_without_redelivery() {
        let dir = tempdir().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let recorder = Recorder {
            trip: Some((2, Arc::clone(&failing))),
            ..Default::default()
        };
        let node = RaftNode::start(config(dir.path(), &[]), recorder, Arc::new(Unreachable))
            .await
            .unwrap();
        node.core.metadata.fail_writes_when(Arc::clone(&failing));
        wait_for_leader(&node).await;

        assert_eq!(node.propose(b"a".to_vec()).await.unwrap(), 1);
        // Entry 2 reached the application before its applied index failed
        // to persist, so the caller sees it applied.
        assert_eq!(node.propose(b"b".to_vec()).await.unwrap(), 2);
        assert!(node.propose(b"c".to_vec()).await.is_err());

        for _ in 0..100 {
            if node.core.state.lock().halted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            node.core.state.lock().halted,
            Some(HaltReason::DurabilityFailure)
        );

        // Healthy disk again, but the node stays halted.
        failing.store(false, Ordering::SeqCst);
        let err = node.propose(b"d".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::Storage(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.with_state_machine(|sm| {
            assert_eq!(sm.applied, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        });
        assert!(node.core.state.lock().pending.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_sealed_segment_limit_triggers_snapshot() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), &[]);
        cfg.log.max_segment_bytes = 200;
        cfg.log.max_sealed_segments = 2;
        cfg.snapshot.distance = 1_000_000;
        let node = RaftNode::start(cfg, Recorder::default(), Arc::new(Unreachable))
            .await
            .unwrap();
        wait_for_leader(&node).await;

        for i in 0..20u8 {
            node.propose(vec![i; 32]).await.unwrap();
        }
        let mut first = 0;
        for _ in 0..100 {
            first = node.status().last_snapshot_index;
            if first > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first > 0, "no snapshot after filling sealed segments");
        assert!(node.core.log.sealed_segment_count() <= 3);

        // The trigger is armed again after each snapshot.
        for i in 20..60u8 {
            node.propose(vec![i; 32]).await.unwrap();
        }
        let mut latest = first;
        for _ in 0..100 {
            latest = node.status().last_snapshot_index;
            if latest > first {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(latest > first, "snapshot trigger never re-armed");
        assert!(node.core.log.sealed_segment_count() <= 3);
        assert!(node.core.log.start_index() > first);

        node.with_state_machine(|sm| {
            let indices: Vec<_> = sm.applied.iter().map(|(index, _)| *index).collect();
            assert_eq!(indices, (1..=60).collect::<Vec<LogIndex>>());
        });
        node.shutdown().await;
    }
}
