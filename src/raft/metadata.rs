//! Durable metadata store.
//!
//! Small persistent facts (current term, vote, indices) live in an
//! append-only op journal with periodic compaction. State is kept in
//! numbered generations, each made of three files:
//!
//! - `N.Log`: journal of `u32 length | encoded MetaOp` records
//! - `N.data`: the full key/value map as of the start of generation N
//! - `N.metadata`: marker written last; a generation without one is ignored
//!
//! Compaction writes generation N+1 completely and only then removes N.
//! Every `set`/`delete` is flushed to disk before it returns.

use crate::codec::{self, read_frame, write_frame};
use crate::config::MetadataConfig;
use crate::error::{RaftError, Result};
use crate::raft::segment::remove_if_exists;
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

/// Well-known metadata keys.
pub mod keys {
    pub const CURRENT_TERM: &str = "current_term";
    pub const VOTED_FOR: &str = "voted_for";
    pub const COMMITTED_INDEX: &str = "committed_index";
    pub const LAST_APPLIED_INDEX: &str = "last_applied_index";
    pub const LAST_SNAPSHOT_INDEX: &str = "last_snapshot_index";
    pub const LAST_SNAPSHOT_TERM: &str = "last_snapshot_term";
    pub const LEADER_ID: &str = "leader_id";
}

/// A stored metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaValue {
    Int(i64),
    Str(String),
}

/// One journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum MetaOp {
    Set { key: String, value: MetaValue },
    Delete { key: String },
}

struct Generation {
    number: u64,
    log: File,
    log_len: u64,
}

struct MetadataInner {
    map: BTreeMap<String, MetaValue>,
    generation: Generation,
}

/// Generational op-log metadata store. Internally locked.
pub struct MetadataStore {
    dir: PathBuf,
    max_oplog_bytes: u64,
    inner: Mutex<MetadataInner>,
    #[cfg(test)]
    fail_writes: Mutex<Option<Arc<AtomicBool>>>,
}

fn log_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}.Log", n))
}

fn data_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}.data", n))
}

fn marker_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}.metadata", n))
}

fn parse_generation(file_name: &str) -> Option<u64> {
    let (stem, ext) = file_name.split_once('.')?;
    match ext {
        "Log" | "data" | "metadata" => stem.parse().ok(),
        _ => None,
    }
}

impl MetadataStore {
    /// Open the store in `dir`, loading the newest complete generation.
    pub fn open(dir: &Path, config: &MetadataConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut generations = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            if let Some(n) = parse_generation(&dir_entry.file_name().to_string_lossy()) {
                generations.push(n);
            }
        }
        generations.sort_unstable();
        generations.dedup();

        let current = generations
            .iter()
            .rev()
            .copied()
            .find(|n| marker_path(dir, *n).exists());

        let (map, generation) = match current {
            Some(n) => Self::load_generation(dir, n)?,
            None => {
                let map = BTreeMap::new();
                let generation = Self::write_generation(dir, 1, &map)?;
                (map, generation)
            }
        };

        // Everything but the live generation is either superseded or incomplete.
        for n in generations {
            if n != generation.number {
                Self::remove_generation(dir, n)?;
            }
        }

        info!(
            dir = %dir.display(),
            generation = generation.number,
            keys = map.len(),
            "Opened metadata store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_oplog_bytes: config.max_oplog_bytes,
            inner: Mutex::new(MetadataInner { map, generation }),
            #[cfg(test)]
            fail_writes: Mutex::new(None),
        })
    }

    fn load_generation(dir: &Path, n: u64) -> Result<(BTreeMap<String, MetaValue>, Generation)> {
        let snapshot = fs::read(data_path(dir, n))?;
        let mut map: BTreeMap<String, MetaValue> = codec::decode(&snapshot).map_err(|e| {
            RaftError::DataCorruption(format!("metadata generation {}: {}", n, e))
        })?;

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path(dir, n))?;

        let mut valid_len = 0u64;
        {
            let mut reader = BufReader::new(&mut log);
            while let Some(record) = read_frame(&mut reader)? {
                let op: MetaOp = match codec::decode(&record) {
                    Ok(op) => op,
                    Err(_) => break,
                };
                match op {
                    MetaOp::Set { key, value } => {
                        map.insert(key, value);
                    }
                    MetaOp::Delete { key } => {
                        map.remove(&key);
                    }
                }
                valid_len += (codec::FRAME_HEADER_LEN + record.len()) as u64;
            }
        }

        let disk_len = log.metadata()?.len();
        if disk_len != valid_len {
            warn!(
                generation = n,
                kept = valid_len,
                found = disk_len,
                "Cutting torn record from metadata journal"
            );
            log.set_len(valid_len)?;
            log.sync_data()?;
        }

        Ok((
            map,
            Generation {
                number: n,
                log,
                log_len: valid_len,
            },
        ))
    }

    fn write_generation(
        dir: &Path,
        n: u64,
        map: &BTreeMap<String, MetaValue>,
    ) -> Result<Generation> {
        let mut data = File::create(data_path(dir, n))?;
        data.write_all(&codec::encode(map)?)?;
        data.sync_all()?;

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path(dir, n))?;
        log.sync_all()?;

        let mut marker = File::create(marker_path(dir, n))?;
        marker.write_all(&n.to_be_bytes())?;
        marker.sync_all()?;

        Ok(Generation {
            number: n,
            log,
            log_len: 0,
        })
    }

    fn remove_generation(dir: &Path, n: u64) -> Result<()> {
        // Marker first, so a half-removed generation is never loaded.
        remove_if_exists(&marker_path(dir, n))?;
        remove_if_exists(&log_path(dir, n))?;
        remove_if_exists(&data_path(dir, n))?;
        Ok(())
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<MetaValue> {
        self.inner.lock().map.get(key).cloned()
    }

    /// Look up an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(MetaValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    /// Look up a string value.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(MetaValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Durably set `key`.
    pub fn set(&self, key: &str, value: MetaValue) -> Result<()> {
        self.apply(MetaOp::Set {
            key: key.to_string(),
            value,
        })
    }

    /// Durably set an unsigned integer.
    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, MetaValue::Int(value as i64))
    }

    /// Durably set an optional node id; `None` removes the key.
    pub fn set_node(&self, key: &str, node: Option<NodeId>) -> Result<()> {
        match node {
            Some(id) => self.set_u64(key, id),
            None => self.delete(key),
        }
    }

    /// Durably remove `key`.
    pub fn delete(&self, key: &str) -> Result<()> {
        if self.inner.lock().map.contains_key(key) {
            self.apply(MetaOp::Delete {
                key: key.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Fail every write while `switch` is set.
    #[cfg(test)]
    pub(crate) fn fail_writes_when(&self, switch: Arc<AtomicBool>) {
        *self.fail_writes.lock() = Some(switch);
    }

    fn apply(&self, op: MetaOp) -> Result<()> {
        #[cfg(test)]
        if let Some(switch) = self.fail_writes.lock().as_ref() {
            if switch.load(Ordering::SeqCst) {
                let e = std::io::Error::new(std::io::ErrorKind::Other, "injected write failure");
                return Err(e.into());
            }
        }
        let record = codec::encode(&op)?;
        let mut inner = self.inner.lock();

        let generation = &mut inner.generation;
        generation.log.seek(SeekFrom::Start(generation.log_len))?;
        let written = write_frame(&mut generation.log, &record)?;
        generation.log.sync_data()?;
        generation.log_len += written;

        match op {
            MetaOp::Set { key, value } => {
                inner.map.insert(key, value);
            }
            MetaOp::Delete { key } => {
                inner.map.remove(&key);
            }
        }

        if inner.generation.log_len > self.max_oplog_bytes {
            self.compact_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Force a compaction into a new generation.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut MetadataInner) -> Result<()> {
        let old = inner.generation.number;
        let next = Self::write_generation(&self.dir, old + 1, &inner.map)?;
        inner.generation = next;
        Self::remove_generation(&self.dir, old)?;
        debug!(from = old, to = old + 1, keys = inner.map.len(), "Compacted metadata journal");
        Ok(())
    }

    /// Remove every key and start a fresh generation.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.map.clear();
        self.compact_locked(&mut inner)
    }

    /// Number of the live generation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation.number
    }
}

/// Typed view of the persisted Raft facts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentMetadata {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub committed_index: LogIndex,
    pub last_applied_index: LogIndex,
    pub last_snapshot_index: LogIndex,
    pub last_snapshot_term: Term,
    pub leader_id: Option<NodeId>,
}

impl PersistentMetadata {
    /// Read every fact from the store, defaulting missing ones.
    pub fn load(store: &MetadataStore) -> Self {
        let int = |key: &str| store.get_int(key).map(|v| v as u64);
        Self {
            current_term: int(keys::CURRENT_TERM).unwrap_or(0),
            voted_for: int(keys::VOTED_FOR),
            committed_index: int(keys::COMMITTED_INDEX).unwrap_or(0),
            last_applied_index: int(keys::LAST_APPLIED_INDEX).unwrap_or(0),
            last_snapshot_index: int(keys::LAST_SNAPSHOT_INDEX).unwrap_or(0),
            last_snapshot_term: int(keys::LAST_SNAPSHOT_TERM).unwrap_or(0),
            leader_id: int(keys::LEADER_ID),
        }
    }
}
