//! The committer task.
//!
//! Every side effect that touches the state machine runs here, one task
//! at a time: applying committed entries, building and installing
//! snapshots, and invoking `replicate` callbacks. Callbacks therefore never
//! run under the state lock.

use super::log::EntryKind;
use super::metadata::keys;
use super::node::Core;
use super::snapshot::{SnapshotMeta, SnapshotReader};
use super::state::{HaltReason, ReplicateCallback, ReplicateResult};
use super::StateMachine;
use crate::error::{RaftError, Result};
use crate::observability;
use crate::types::{LogIndex, Term};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Work queued for the committer.
pub(crate) enum CommitterTask {
    /// Apply committed entries. A follower passes the highest index it has
    /// verified against the leader; the commit index then advances one
    /// entry at a time up to that bound.
    Apply { up_to: Option<LogIndex> },
    /// Deliver already-resolved callbacks.
    Resolve(Vec<(ReplicateCallback, ReplicateResult)>),
    /// A `replicate` deadline expired.
    Timeout { index: LogIndex, term: Term },
    /// Consider building a snapshot; `requested` bypasses the distance check.
    BuildSnapshot { requested: bool },
    /// Install a fully received snapshot file.
    InstallSnapshot {
        meta: SnapshotMeta,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub(crate) async fn run<S: StateMachine>(
    core: Arc<Core<S>>,
    mut rx: mpsc::UnboundedReceiver<CommitterTask>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            CommitterTask::Apply { up_to } => {
                if let Err(e) = apply_committed(&core, up_to) {
                    error!(node_id = core.id, error = %e, "Failed to apply committed entries");
                    if halts(&core, &e) {
                        break;
                    }
                    continue;
                }
                if let Err(e) = build_snapshot(&core, false) {
                    warn!(node_id = core.id, error = %e, "Snapshot build failed");
                }
            }
            CommitterTask::Resolve(resolved) => {
                for (callback, result) in resolved {
                    callback(result);
                }
            }
            CommitterTask::Timeout { index, term } => {
                let expired = {
                    let mut state = core.state.lock();
                    let current = state.pending.get(&index).map(|p| p.term) == Some(term);
                    if current {
                        state.pending.remove(&index)
                    } else {
                        None
                    }
                };
                if let Some(pending) = expired {
                    debug!(node_id = core.id, index, "Replication deadline expired");
                    let (callback, result) = pending.resolve(ReplicateResult::failed());
                    callback(result);
                }
            }
            CommitterTask::BuildSnapshot { requested } => {
                if let Err(e) = build_snapshot(&core, requested) {
                    warn!(node_id = core.id, error = %e, "Snapshot build failed");
                    core.log.arm_snapshot_trigger();
                }
            }
            CommitterTask::InstallSnapshot { meta, reply } => {
                let result = install_snapshot(&core, &meta);
                if let Err(e) = &result {
                    error!(
                        node_id = core.id,
                        index = meta.last_included_index,
                        error = %e,
                        "Failed to install snapshot"
                    );
                }
                let fatal = result.as_ref().err().map_or(false, |e| halts(&core, e));
                let _ = reply.send(result);
                if fatal {
                    break;
                }
            }
            CommitterTask::Shutdown => break,
        }
    }
    debug!(node_id = core.id, "Committer stopped");
}

/// Stop on errors that leave durable state uncertain. Pending calls fail
/// and the node refuses new ones.
fn halts<S: StateMachine>(core: &Core<S>, e: &RaftError) -> bool {
    if !e.is_durability_failure() {
        return false;
    }
    error!(node_id = core.id, error = %e, "Durability failure, halting committer");
    core.halt(HaltReason::DurabilityFailure);
    true
}

/// Apply entries up to the commit index.
fn apply_committed<S: StateMachine>(core: &Core<S>, up_to: Option<LogIndex>) -> Result<()> {
    loop {
        let entry = {
            let mut state = core.state.lock();
            if let Some(bound) = up_to {
                let bound = bound.min(core.log.last_index());
                if state.committed_index < bound {
                    let next = state.committed_index + 1;
                    core.metadata.set_u64(keys::COMMITTED_INDEX, next)?;
                    state.committed_index = next;
                }
            }
            if state.last_applied >= state.committed_index {
                observability::update_raft_metrics(
                    state.current_term,
                    state.committed_index,
                    state.last_applied,
                );
                return Ok(());
            }

            let index = state.last_applied + 1;
            if index <= state.last_snapshot_index {
                // Covered by an installed snapshot.
                core.metadata
                    .set_u64(keys::LAST_APPLIED_INDEX, state.last_snapshot_index)?;
                state.last_applied = state.last_snapshot_index;
                continue;
            }
            match core.log.get_entry(index)? {
                Some(entry) => entry,
                None => {
                    return Err(RaftError::Internal(format!(
                        "committed entry {} missing from the log",
                        index
                    )))
                }
            }
        };

        if entry.kind == EntryKind::AppendLog {
            core.state_machine
                .lock()
                .commit_entry(entry.data_bytes(), entry.index)?;
        }

        // The cursor moves before the persist; a delivered entry is never
        // delivered again.
        let (persisted, resolved) = {
            let mut state = core.state.lock();
            state.last_applied = entry.index;
            let resolved = state.pending.remove(&entry.index).map(|pending| {
                let result = if pending.term == entry.term {
                    ReplicateResult::committed(entry.index)
                } else {
                    ReplicateResult::failed()
                };
                pending.resolve(result)
            });
            (
                core.metadata.set_u64(keys::LAST_APPLIED_INDEX, entry.index),
                resolved,
            )
        };
        if let Some((callback, result)) = resolved {
            callback(result);
        }
        persisted?;
    }
}

/// Snapshot the state machine as of the last applied index and compact the
/// log behind it.
fn build_snapshot<S: StateMachine>(core: &Core<S>, requested: bool) -> Result<()> {
    let (index, term) = {
        let state = core.state.lock();
        let due = core.builder.should_build(
            state.last_applied,
            state.last_snapshot_index,
            core.log.start_index(),
            requested,
        );
        if !due {
            if requested {
                core.log.arm_snapshot_trigger();
            }
            return Ok(());
        }
        let index = state.last_applied;
        let term = core.log.term_at(index)?.ok_or(RaftError::LogIndexOutOfRange {
            index,
            first: core.log.start_index(),
            last: core.log.last_index(),
        })?;
        (index, term)
    };

    let meta = {
        let state_machine = core.state_machine.lock();
        core.builder
            .build(&core.snapshots, &*state_machine, index, term)?
    };

    {
        let mut state = core.state.lock();
        core.metadata.set_u64(keys::LAST_SNAPSHOT_INDEX, index)?;
        core.metadata.set_u64(keys::LAST_SNAPSHOT_TERM, term)?;
        state.last_snapshot_index = index;
        state.last_snapshot_term = term;
        core.log.truncate_prefix(index)?;
    }
    core.snapshots.remove_older_than(index)?;
    core.log.arm_snapshot_trigger();

    info!(
        node_id = core.id,
        index,
        term,
        size = meta.size,
        "Built snapshot"
    );
    observability::record_snapshot("built");
    Ok(())
}

/// Replace the state machine with a received snapshot.
fn install_snapshot<S: StateMachine>(core: &Core<S>, meta: &SnapshotMeta) -> Result<()> {
    let index = meta.last_included_index;
    let term = meta.last_included_term;

    if index <= core.state.lock().last_applied {
        debug!(node_id = core.id, index, "Snapshot already covered by applied entries");
        return Ok(());
    }

    {
        let mut reader = SnapshotReader::open(&meta.path)?;
        core.state_machine
            .lock()
            .install_snapshot(&mut reader, index)?;
    }

    let resolved = {
        let mut state = core.state.lock();
        let keeps_suffix = core.log.term_at(index)? == Some(term);
        if keeps_suffix {
            core.log.truncate_prefix(index)?;
        } else {
            core.log.reset(index)?;
        }

        let committed = state.committed_index.max(index);
        core.metadata.set_u64(keys::LAST_SNAPSHOT_INDEX, index)?;
        core.metadata.set_u64(keys::LAST_SNAPSHOT_TERM, term)?;
        core.metadata.set_u64(keys::COMMITTED_INDEX, committed)?;
        core.metadata.set_u64(keys::LAST_APPLIED_INDEX, index)?;
        state.last_snapshot_index = index;
        state.last_snapshot_term = term;
        state.committed_index = committed;
        state.last_applied = index;

        let doomed = if keeps_suffix {
            let kept = state.pending.split_off(&(index + 1));
            std::mem::replace(&mut state.pending, kept)
        } else {
            std::mem::take(&mut state.pending)
        };
        doomed
            .into_values()
            .map(|pending| pending.resolve(ReplicateResult::failed()))
            .collect::<Vec<_>>()
    };
    for (callback, result) in resolved {
        callback(result);
    }

    core.snapshots.remove_older_than(index)?;
    info!(node_id = core.id, index, term, "Installed snapshot");
    observability::record_snapshot("installed");
    Ok(())
}
