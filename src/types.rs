//! Core type definitions shared across the consensus engine.
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`NodeId`] = `u64`: Cluster node identifier
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position (1-based, 0 means "none")

/// Unique identifier for a cluster node.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Index into the Raft log.
pub type LogIndex = u64;
