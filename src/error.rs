//! Error types for the consensus engine.
//!
//! This module provides a unified error type [`RaftError`] for all operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Consensus**: leadership and commitment outcomes visible to callers
//! - **Log**: index range and truncation violations
//! - **Storage**: disk and corruption failures (fatal for the current operation)
//! - **Snapshot**: header validation and transfer bookkeeping
//! - **Network**: peer connectivity and RPC timeouts (retried by peer agents)
//! - **Configuration**: invalid settings
//!
//! # Example
//!
//! ```rust
//! use strata_raft::error::{RaftError, Result};
//!
//! fn check_index(index: u64, last: u64) -> Result<()> {
//!     if index > last {
//!         return Err(RaftError::LogIndexOutOfRange { index, first: 1, last });
//!     }
//!     Ok(())
//! }
//!
//! let err = check_index(10, 5).unwrap_err();
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for consensus operations.
#[derive(Error, Debug)]
pub enum RaftError {
    // Consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("Entry at index {index} was not committed before the deadline")]
    NotCommitted { index: u64 },

    // Log errors
    #[error("Log index {index} out of range [{first}, {last}]")]
    LogIndexOutOfRange { index: u64, first: u64, last: u64 },

    #[error("Log gap: expected index {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    #[error("Refusing to truncate committed entry {index} (committed index {committed})")]
    CommittedTruncation { index: u64, committed: u64 },

    // Storage errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    // Snapshot errors
    #[error("Snapshot header rejected: {0}")]
    SnapshotHeader(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot offset mismatch: stored {stored}, received {received}")]
    SnapshotOffsetMismatch { stored: u64, received: u64 },

    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Node is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Check if error is retryable.
    ///
    /// Retryable errors are handled by peer agents or callers re-issuing the
    /// request; everything else is a hard failure for the current operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::NotCommitted { .. }
                | RaftError::ConnectionFailed(_)
                | RaftError::Timeout(_)
                | RaftError::SnapshotOffsetMismatch { .. }
        )
    }

    /// Whether the error means local durable state may be uncertain.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self, RaftError::Io(_) | RaftError::DataCorruption(_))
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, RaftError>;
