//! Common test utilities for integration tests.
//!
//! An in-process cluster: every node gets a [`NodeRpc`] that routes calls
//! straight into the target node's handlers through a shared
//! [`LocalNetwork`], which can isolate nodes to simulate partitions.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strata_raft::config::PeerConfig;
use strata_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use strata_raft::{
    LogEntry, LogIndex, NodeId, RaftConfig, RaftError, RaftNode, RaftRpc, Result, Role,
    StateMachine,
};
use tempfile::TempDir;
use tokio::time::Instant;

/// Default patience for cluster-level convergence.
pub const CONVERGE: Duration = Duration::from_secs(10);

/// State machine that records every delivered entry.
#[derive(Debug, Clone, Default)]
pub struct RecordingMachine {
    pub applied: Vec<(LogIndex, Vec<u8>)>,
    pub installs: usize,
}

impl StateMachine for RecordingMachine {
    fn commit_entry(&mut self, payload: &[u8], index: LogIndex) -> Result<()> {
        self.applied.push((index, payload.to_vec()));
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
        self.installs += 1;
        Ok(())
    }
}

pub type TestNode = RaftNode<RecordingMachine>;

/// Routes RPCs between in-process nodes.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<TestNode>>>,
    isolated: Mutex<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn register(&self, node: Arc<TestNode>) {
        self.nodes.write().insert(node.node_id(), node);
    }

    pub fn unregister(&self, id: NodeId) -> Option<Arc<TestNode>> {
        self.nodes.write().remove(&id)
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: NodeId) {
        self.isolated.lock().insert(id);
    }

    pub fn heal(&self) {
        self.isolated.lock().clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<TestNode>> {
        {
            let isolated = self.isolated.lock();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(RaftError::ConnectionFailed(format!(
                    "{} -> {} partitioned",
                    from, to
                )));
            }
        }
        self.nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or(RaftError::NodeNotFound(to))
    }
}

/// One node's view of the [`LocalNetwork`].
pub struct NodeRpc {
    from: NodeId,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl RaftRpc for NodeRpc {
    async fn connect(&self, target: NodeId) -> Result<()> {
        self.network.route(self.from, target).map(|_| ())
    }

    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.handle_request_vote(request).await?;
        // A partition raised mid-call drops the reply.
        self.network.route(target, self.from)?;
        Ok(response)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.handle_append_entries(request).await?;
        self.network.route(target, self.from)?;
        Ok(response)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.handle_install_snapshot(request).await?;
        self.network.route(target, self.from)?;
        Ok(response)
    }
}

/// Configuration for node `id` of a `size`-node cluster with fast timers.
pub fn test_config(id: NodeId, size: u64, base: &Path) -> RaftConfig {
    let mut config = RaftConfig::development(id, &base.join(format!("node-{}", id)));
    config.election_timeout = Duration::from_millis(150);
    config.heartbeat_interval = Duration::from_millis(20);
    config.rpc_timeout = Duration::from_millis(200);
    config.replicate_timeout = Duration::from_secs(3);
    config.peers = (1..=size)
        .filter(|peer| *peer != id)
        .map(|peer| PeerConfig {
            id: peer,
            address: "127.0.0.1".to_string(),
            port: 9000 + peer as u16,
        })
        .collect();
    config
}

/// A running in-process cluster.
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: HashMap<NodeId, Arc<TestNode>>,
    _dir: TempDir,
}

impl TestCluster {
    pub async fn start(size: u64) -> Self {
        Self::start_with(size, |_| {}).await
    }

    pub async fn start_with<F>(size: u64, tweak: F) -> Self
    where
        F: Fn(&mut RaftConfig),
    {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let network = Arc::new(LocalNetwork::default());
        let mut nodes = HashMap::new();

        for id in 1..=size {
            let mut config = test_config(id, size, dir.path());
            tweak(&mut config);
            let rpc = Arc::new(NodeRpc {
                from: id,
                network: Arc::clone(&network),
            });
            let node = RaftNode::start(config, RecordingMachine::default(), rpc)
                .await
                .expect("Failed to start node");
            let node = Arc::new(node);
            network.register(Arc::clone(&node));
            nodes.insert(id, node);
        }

        Self {
            network,
            nodes,
            _dir: dir,
        }
    }

    pub fn node(&self, id: NodeId) -> &Arc<TestNode> {
        &self.nodes[&id]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Wait until one node of `among` leads and every node of `among`
    /// recognises it in the same term.
    pub async fn wait_for_leader(&self, among: &[NodeId]) -> NodeId {
        let found = poll(CONVERGE, || async move {
            let statuses: Vec<_> = among.iter().map(|id| self.node(*id).status()).collect();
            let leader = statuses
                .iter()
                .filter(|s| s.role == Role::Leader)
                .max_by_key(|s| s.term)?;
            let agreed = statuses
                .iter()
                .all(|s| s.term == leader.term && s.leader_id == Some(leader.node_id));
            agreed.then_some(leader.node_id)
        })
        .await;
        found.expect("No leader elected")
    }

    /// Wait until every node of `ids` has applied through `index`.
    pub async fn wait_for_applied(&self, ids: &[NodeId], index: LogIndex) -> bool {
        poll(CONVERGE, || async move {
            ids.iter()
                .all(|id| self.node(*id).status().last_applied >= index)
                .then_some(())
        })
        .await
        .is_some()
    }

    /// Every entry of node `id`'s log.
    pub fn log_of(&self, id: NodeId) -> Vec<LogEntry> {
        let node = self.node(id);
        let status = node.status();
        let start = status.last_snapshot_index + 1;
        node.read_log_entries(start, (status.last_log_index + 1).saturating_sub(start) as usize)
            .expect("Failed to read log")
    }

    pub fn applied_of(&self, id: NodeId) -> Vec<(LogIndex, Vec<u8>)> {
        self.node(id).with_state_machine(|sm| sm.applied.clone())
    }

    pub async fn shutdown(self) {
        for id in self.ids() {
            if let Some(node) = self.network.unregister(id) {
                node.shutdown().await;
            }
        }
    }
}

/// Poll `check` every 10ms until it yields a value or `timeout` passes.
pub async fn poll<T, F, Fut>(timeout: Duration, check: F) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert the log matching property between two logs.
pub fn assert_logs_match(a: &[LogEntry], b: &[LogEntry]) {
    let by_index: HashMap<LogIndex, &LogEntry> = b.iter().map(|e| (e.index, e)).collect();
    for entry in a.iter().rev() {
        if let Some(other) = by_index.get(&entry.index) {
            if other.term == entry.term {
                for earlier in a.iter().filter(|e| e.index <= entry.index) {
                    if let Some(theirs) = by_index.get(&earlier.index) {
                        assert_eq!(
                            (earlier.term, earlier.data_bytes()),
                            (theirs.term, theirs.data_bytes()),
                            "logs diverge at index {} below matching index {}",
                            earlier.index,
                            entry.index
                        );
                    }
                }
                return;
            }
        }
    }
}
