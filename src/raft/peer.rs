//! Per-peer replication agents.
//!
//! Each remote peer gets its own task. The core drives it with commands;
//! a new command cancels whatever RPC the agent has in flight. All
//! consensus decisions stay in the core behind [`ReplicationContext`], the
//! agent only moves requests and responses.

use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
use super::snapshot::SnapshotMeta;
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, NodeId, Term};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

const CONNECT_RETRY_MIN: Duration = Duration::from_millis(50);
const CONNECT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Commands sent from the core to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerCommand {
    /// Establish connectivity, retrying with backoff.
    Connect,
    /// Solicit a vote for the current candidacy.
    Election,
    /// Replicate continuously as leader.
    AppendEntries,
    /// Stop the current activity and idle.
    Sleep,
    /// Terminate the agent.
    Exit,
}

/// Leader's description of an outgoing snapshot transfer.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotPlan {
    pub term: Term,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
}

/// What the agent should send next.
#[derive(Debug)]
pub(crate) enum ReplicationPlan {
    Append(AppendEntriesRequest),
    Snapshot(SnapshotPlan),
    /// Leadership was lost; stop replicating.
    NotLeader,
}

/// Core-side hooks used by the agents.
pub(crate) trait ReplicationContext: Send + Sync + 'static {
    /// The vote request for the current candidacy, `None` once it is over.
    fn vote_request(&self) -> Option<RequestVoteRequest>;

    fn handle_vote_response(
        &self,
        peer: NodeId,
        request: &RequestVoteRequest,
        response: RequestVoteResponse,
    ) -> Result<()>;

    fn plan_replication(&self, peer: NodeId) -> Result<ReplicationPlan>;

    /// Returns whether this node is still leader of the request's term.
    fn handle_append_response(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> Result<bool>;

    /// Returns whether this node is still leader of `term`.
    fn handle_snapshot_response(
        &self,
        peer: NodeId,
        term: Term,
        response: &InstallSnapshotResponse,
    ) -> Result<bool>;

    /// The peer now holds the snapshot ending at `last_included_index`.
    fn snapshot_sent(&self, peer: NodeId, last_included_index: LogIndex) -> Result<()>;
}

/// Agent timing parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AgentSettings {
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub snapshot_chunk_size: usize,
}

/// Handle the core keeps for a running agent.
#[derive(Debug)]
pub(crate) struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
    notify: Arc<Notify>,
}

impl PeerHandle {
    /// Spawn an agent for `peer`.
    pub fn spawn<C: ReplicationContext>(
        peer: NodeId,
        ctx: Arc<C>,
        rpc: Arc<dyn RaftRpc>,
        settings: AgentSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let agent = PeerAgent {
            peer,
            ctx,
            rpc,
            notify: Arc::clone(&notify),
            settings,
        };
        let task = tokio::spawn(agent.run(rx));
        (Self { tx, notify }, task)
    }

    pub fn send(&self, command: PeerCommand) {
        let _ = self.tx.send(command);
    }

    /// Tell a replicating agent that there is new work.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

struct PeerAgent<C> {
    peer: NodeId,
    ctx: Arc<C>,
    rpc: Arc<dyn RaftRpc>,
    notify: Arc<Notify>,
    settings: AgentSettings,
}

impl<C: ReplicationContext> PeerAgent<C> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PeerCommand>) {
        let mut next = None;
        loop {
            let command = match next.take() {
                Some(command) => command,
                None => match rx.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                PeerCommand::Exit => break,
                PeerCommand::Sleep => {
                    debug!(peer = self.peer, "Agent idle");
                    continue;
                }
                _ => {}
            }

            tokio::select! {
                _ = self.execute(command) => {}
                incoming = rx.recv() => match incoming {
                    Some(command) => next = Some(command),
                    None => break,
                },
            }
        }
        debug!(peer = self.peer, "Agent stopped");
    }

    async fn execute(&self, command: PeerCommand) {
        match command {
            PeerCommand::Connect => self.connect().await,
            PeerCommand::Election => self.request_vote().await,
            PeerCommand::AppendEntries => self.replicate().await,
            PeerCommand::Sleep | PeerCommand::Exit => {}
        }
    }

    async fn connect(&self) {
        let mut backoff = CONNECT_RETRY_MIN;
        loop {
            match self.rpc.connect(self.peer).await {
                Ok(()) => {
                    debug!(peer = self.peer, "Connected to peer");
                    return;
                }
                Err(e) => {
                    debug!(peer = self.peer, error = %e, "Connect failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_RETRY_MAX);
                }
            }
        }
    }

    async fn request_vote(&self) {
        while let Some(request) = self.ctx.vote_request() {
            let sent = timeout(
                self.settings.rpc_timeout,
                self.rpc.request_vote(self.peer, request.clone()),
            )
            .await;
            match sent {
                Ok(Ok(response)) => {
                    if let Err(e) = self.ctx.handle_vote_response(self.peer, &request, response) {
                        error!(peer = self.peer, error = %e, "Failed to handle vote response");
                    }
                    return;
                }
                Ok(Err(e)) => {
                    rpc_failed(self.peer, "RequestVote", &e);
                    sleep(self.settings.heartbeat_interval).await;
                }
                Err(_) => debug!(peer = self.peer, "RequestVote timed out"),
            }
        }
    }

    async fn replicate(&self) {
        let heartbeat = self.settings.heartbeat_interval;
        let mut heartbeat_due = Instant::now();

        loop {
            let plan = match self.ctx.plan_replication(self.peer) {
                Ok(plan) => plan,
                Err(e) => {
                    error!(peer = self.peer, error = %e, "Failed to plan replication");
                    sleep(heartbeat).await;
                    continue;
                }
            };

            let request = match plan {
                ReplicationPlan::NotLeader => return,
                ReplicationPlan::Snapshot(plan) => {
                    match self.send_snapshot(&plan).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            warn!(
                                peer = self.peer,
                                index = plan.meta.last_included_index,
                                error = %e,
                                "Snapshot transfer failed"
                            );
                            sleep(heartbeat).await;
                        }
                    }
                    heartbeat_due = Instant::now() + heartbeat;
                    continue;
                }
                ReplicationPlan::Append(request) => request,
            };

            // Nothing new: wait for work or the next heartbeat.
            if request.entries.is_empty() && Instant::now() < heartbeat_due {
                tokio::select! {
                    _ = self.notify.notified() => heartbeat_due = Instant::now(),
                    _ = sleep_until(heartbeat_due) => {}
                }
                continue;
            }

            let sent = timeout(
                self.settings.rpc_timeout,
                self.rpc.append_entries(self.peer, request.clone()),
            )
            .await;
            match sent {
                Ok(Ok(response)) => {
                    heartbeat_due = Instant::now() + heartbeat;
                    match self.ctx.handle_append_response(self.peer, &request, response) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            error!(peer = self.peer, error = %e, "Failed to handle append response");
                            sleep(heartbeat).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    rpc_failed(self.peer, "AppendEntries", &e);
                    sleep(heartbeat).await;
                }
                Err(_) => debug!(peer = self.peer, "AppendEntries timed out"),
            }
        }
    }

    /// Stream a snapshot file. Returns `Ok(false)` once leadership is lost.
    async fn send_snapshot(&self, plan: &SnapshotPlan) -> Result<bool> {
        let meta = &plan.meta;
        let mut file = tokio::fs::File::open(&meta.path).await?;
        let mut buf = vec![0u8; self.settings.snapshot_chunk_size.max(1)];
        let mut offset = 0u64;

        info!(
            peer = self.peer,
            index = meta.last_included_index,
            size = meta.size,
            "Sending snapshot"
        );

        loop {
            file.seek(SeekFrom::Start(offset)).await?;
            let len = read_chunk(&mut file, &mut buf).await?;
            let end = offset + len as u64;
            let done = end >= meta.size;

            let request = InstallSnapshotRequest {
                term: plan.term,
                leader_id: plan.leader_id,
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                offset,
                data: buf[..len].to_vec(),
                done,
            };
            let response = match timeout(
                self.settings.rpc_timeout,
                self.rpc.install_snapshot(self.peer, request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(RaftError::Timeout(
                        self.settings.rpc_timeout.as_millis() as u64
                    ))
                }
            };

            if !self
                .ctx
                .handle_snapshot_response(self.peer, plan.term, &response)?
            {
                return Ok(false);
            }

            if response.bytes_stored != end {
                if done && response.bytes_stored == 0 {
                    return Err(RaftError::SnapshotHeader(format!(
                        "peer {} rejected snapshot {}",
                        self.peer, meta.last_included_index
                    )));
                }
                debug!(
                    peer = self.peer,
                    offset,
                    bytes_stored = response.bytes_stored,
                    "Resuming snapshot at peer offset"
                );
                offset = response.bytes_stored.min(meta.size);
                continue;
            }

            if done {
                self.ctx.snapshot_sent(self.peer, meta.last_included_index)?;
                info!(
                    peer = self.peer,
                    index = meta.last_included_index,
                    "Snapshot transfer complete"
                );
                return Ok(true);
            }
            offset = end;
        }
    }
}

/// Retryable failures log at debug, the rest at warn.
fn rpc_failed(peer: NodeId, rpc: &'static str, e: &RaftError) {
    if e.is_retryable() {
        debug!(peer, rpc, error = %e, "RPC failed");
    } else {
        warn!(peer, rpc, error = %e, "RPC failed");
    }
}

/// Fill `buf` from `file`, stopping early only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
