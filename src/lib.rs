//! strata-raft - A Raft consensus engine for replicated state machines.
//!
//! A single node of a Raft cluster: it elects a leader, replicates an
//! ordered log to a majority of peers, and delivers committed entries to an
//! application [`StateMachine`] exactly once, in order.
//!
//! # Features
//!
//! - **Segmented durable log**: rotating data/index segment files with a
//!   bounded in-memory tail cache and prefix/suffix truncation.
//! - **Generational metadata store**: durable term, vote, and index facts
//!   in an append-only op-log with periodic compaction.
//! - **Snapshots**: built on the committer, streamed to lagging followers
//!   in resumable offset-addressed chunks.
//! - **Per-peer replication agents**: one task per peer, cancellable RPCs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RaftNode                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Core: role | term | commit index | pending replications    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Peer agents (one per peer)  │  Committer: apply | snapshot │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  Log store | Metadata store | Snapshot store                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::path::Path;
//! use std::sync::Arc;
//! use strata_raft::{RaftConfig, RaftNode, RaftRpc, StateMachine};
//!
//! struct Counter(u64);
//!
//! impl StateMachine for Counter {
//!     fn commit_entry(&mut self, _payload: &[u8], _index: u64) -> strata_raft::Result<()> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//!
//!     fn build_snapshot(&self, writer: &mut dyn Write, _as_of: u64) -> strata_raft::Result<()> {
//!         writer.write_all(&self.0.to_be_bytes())?;
//!         Ok(())
//!     }
//!
//!     fn install_snapshot(&mut self, reader: &mut dyn Read, _last: u64) -> strata_raft::Result<()> {
//!         let mut buf = [0u8; 8];
//!         reader.read_exact(&mut buf)?;
//!         self.0 = u64::from_be_bytes(buf);
//!         Ok(())
//!     }
//! }
//!
//! async fn run(rpc: Arc<dyn RaftRpc>) -> strata_raft::Result<()> {
//!     let config = RaftConfig::development(1, Path::new("/tmp/raft-1"));
//!     let node = RaftNode::start(config, Counter(0), rpc).await?;
//!     let index = node.propose(b"increment".to_vec()).await?;
//!     println!("applied at {}", index);
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod observability;
pub mod raft;
pub mod types;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::{
    LogEntry, RaftNode, RaftRpc, RaftStatus, ReplicateResult, Role, StateMachine,
};
pub use types::*;
