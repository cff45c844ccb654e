//! Observability for the consensus engine.
//!
//! Provides logging initialisation and the metric names the Raft core
//! reports. No exporter is installed here; embedders install whichever
//! `metrics` recorder they run.

use crate::config::ObservabilityConfig;
use crate::error::{RaftError, Result};
use ::tracing::info;
use metrics::{counter, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Current term.
pub const RAFT_TERM: &str = "raft_term";
/// Highest committed log index.
pub const RAFT_COMMIT_INDEX: &str = "raft_commit_index";
/// Highest applied log index.
pub const RAFT_APPLIED_INDEX: &str = "raft_applied_index";
/// Elections started by this node.
pub const RAFT_ELECTIONS_TOTAL: &str = "raft_elections_total";
/// Entries appended through `replicate`.
pub const RAFT_PROPOSALS_TOTAL: &str = "raft_proposals_total";
/// Snapshots built or installed.
pub const RAFT_SNAPSHOTS_TOTAL: &str = "raft_snapshots_total";

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| RaftError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| RaftError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Update term and index gauges.
pub fn update_raft_metrics(term: u64, commit_index: u64, applied_index: u64) {
    gauge!(RAFT_TERM).set(term as f64);
    gauge!(RAFT_COMMIT_INDEX).set(commit_index as f64);
    gauge!(RAFT_APPLIED_INDEX).set(applied_index as f64);
}

/// Record an election started by this node.
pub fn record_election() {
    counter!(RAFT_ELECTIONS_TOTAL).increment(1);
}

/// Record an entry appended by `replicate`.
pub fn record_proposal() {
    counter!(RAFT_PROPOSALS_TOTAL).increment(1);
}

/// Record a completed snapshot.
pub fn record_snapshot(kind: &'static str) {
    counter!(RAFT_SNAPSHOTS_TOTAL, "kind" => kind).increment(1);
}
