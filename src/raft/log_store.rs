//! Durable, segmented Raft log.
//!
//! The log is a sequence of [`Segment`]s: one active segment receiving
//! appends and any number of sealed, read-only segments keyed by their
//! start index. Recent entries are also kept in a [`LogCache`].
//!
//! Writes are durable before `write` returns. Reads check the cache, then
//! the active segment, then the sealed segments.

use super::log::{LogCache, LogEntry};
use super::segment::{remove_if_exists, Segment};
use crate::config::LogStoreConfig;
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback fired when the sealed segment count crosses the limit.
pub type SnapshotTrigger = Arc<dyn Fn() + Send + Sync>;

struct LogStoreInner {
    active: Segment,
    sealed: BTreeMap<LogIndex, Segment>,
    cache: LogCache,
    trigger: Option<SnapshotTrigger>,
    trigger_armed: bool,
}

impl LogStoreInner {
    fn start_index(&self) -> LogIndex {
        self.sealed
            .values()
            .next()
            .map(|s| s.start_index())
            .unwrap_or_else(|| self.active.start_index())
    }

    fn last_index(&self) -> LogIndex {
        self.active.last_index()
    }

    fn is_empty(&self) -> bool {
        self.active.is_empty() && self.sealed.values().all(|s| s.is_empty())
    }

    fn segment_for(&mut self, index: LogIndex) -> Option<&mut Segment> {
        if self.active.contains(index) {
            return Some(&mut self.active);
        }
        self.sealed
            .range_mut(..=index)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| segment.contains(index))
    }

    fn read(&mut self, index: LogIndex) -> Result<Option<LogEntry>> {
        if index == 0 || index < self.start_index() || index > self.last_index() {
            return Ok(None);
        }
        if let Some(entry) = self.cache.get(index) {
            return Ok(Some(entry.clone()));
        }
        match self.segment_for(index) {
            Some(segment) => segment.read(index).map(Some),
            None => Ok(None),
        }
    }
}

/// The replicated log store. Internally locked; safe to share.
pub struct LogStore {
    dir: PathBuf,
    config: LogStoreConfig,
    inner: Mutex<LogStoreInner>,
}

impl LogStore {
    /// Open (or create) the log under `dir`, recovering every segment found.
    pub fn open(dir: &Path, config: &LogStoreConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut starts = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if Segment::is_staged_file(&name) {
                // Leftover of an interrupted prefix rewrite.
                remove_if_exists(&dir_entry.path())?;
                continue;
            }
            if let Some(start) = Segment::parse_start(&name) {
                starts.push(start);
            }
        }
        starts.sort_unstable();

        let mut segments: Vec<Segment> = Vec::with_capacity(starts.len());
        for start in starts {
            let segment = Segment::open(dir, start)?;
            if let Some(prev) = segments.last() {
                if prev.is_empty() || segment.start_index() <= prev.last_index() {
                    // An empty or rewritten-over segment is superseded by its successor.
                    if let Some(stale) = segments.pop() {
                        warn!(segment = stale.start_index(), "Removing superseded log segment");
                        stale.remove()?;
                    }
                } else if segment.start_index() != prev.next_index() {
                    warn!(
                        expected = prev.next_index(),
                        found = segment.start_index(),
                        "Gap in log segments, discarding the rest"
                    );
                    segment.remove()?;
                    continue;
                }
            }
            segments.push(segment);
        }

        let active = match segments.pop() {
            Some(segment) => segment,
            None => Segment::create(dir, 1)?,
        };
        let sealed: BTreeMap<LogIndex, Segment> =
            segments.into_iter().map(|s| (s.start_index(), s)).collect();

        let inner = LogStoreInner {
            active,
            sealed,
            cache: LogCache::new(config.max_cache_bytes),
            trigger: None,
            trigger_armed: false,
        };

        info!(
            dir = %dir.display(),
            start_index = inner.start_index(),
            last_index = inner.last_index(),
            sealed = inner.sealed.len(),
            "Opened log store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config: config.clone(),
            inner: Mutex::new(inner),
        })
    }

    /// Install the one-shot snapshot request callback and arm it.
    ///
    /// The callback runs on the writing thread with the log lock released.
    pub fn set_snapshot_trigger(&self, trigger: SnapshotTrigger) {
        let mut inner = self.inner.lock();
        inner.trigger = Some(trigger);
        inner.trigger_armed = true;
    }

    /// Re-arm the snapshot trigger after a successful snapshot.
    pub fn arm_snapshot_trigger(&self) {
        self.inner.lock().trigger_armed = true;
    }

    /// Append an entry and return its index.
    ///
    /// An index of zero is assigned `last_index + 1`. An explicit index at or
    /// below `last_index` first truncates the suffix from that index. On an
    /// empty log any explicit index starts the log there.
    pub fn write(&self, mut entry: LogEntry) -> Result<LogIndex> {
        let (index, trigger) = {
            let mut inner = self.inner.lock();
            let next = inner.last_index() + 1;

            if entry.index == 0 {
                entry.index = next;
            } else if entry.index < next {
                self.truncate_suffix_locked(&mut inner, entry.index)?;
            } else if entry.index > next {
                if !inner.is_empty() {
                    return Err(RaftError::LogGap {
                        expected: next,
                        got: entry.index,
                    });
                }
                self.reset_locked(&mut inner, entry.index - 1)?;
            }

            let index = entry.index;
            inner.active.append(&entry)?;
            inner.cache.push(entry);

            if inner.active.data_size() > self.config.max_segment_bytes {
                self.rotate_locked(&mut inner)?;
            }

            let fire = inner.sealed.len() > self.config.max_sealed_segments && inner.trigger_armed;
            if fire {
                inner.trigger_armed = false;
            }
            (index, if fire { inner.trigger.clone() } else { None })
        };

        if let Some(trigger) = trigger {
            debug!(index, "Sealed segment limit reached, requesting snapshot");
            trigger();
        }
        Ok(index)
    }

    fn rotate_locked(&self, inner: &mut LogStoreInner) -> Result<()> {
        let next = inner.active.next_index();
        let fresh = Segment::create(&self.dir, next)?;
        let sealed = std::mem::replace(&mut inner.active, fresh);
        debug!(
            start = sealed.start_index(),
            last = sealed.last_index(),
            bytes = sealed.data_size(),
            "Sealed log segment"
        );
        inner.sealed.insert(sealed.start_index(), sealed);
        Ok(())
    }

    /// Read an entry. `Ok(None)` when the index is outside the log.
    pub fn get_entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        self.inner.lock().read(index)
    }

    /// Read up to `count` consecutive entries starting at `start`.
    pub fn get_entries(&self, start: LogIndex, count: usize) -> Result<Vec<LogEntry>> {
        let mut inner = self.inner.lock();
        let mut entries = Vec::with_capacity(count.min(1024));
        let mut index = start;
        while entries.len() < count {
            match inner.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(entries)
    }

    /// Term of the entry at `index`, if present.
    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        Ok(self.get_entry(index)?.map(|e| e.term))
    }

    /// Index of the last entry; `start_index - 1` when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.inner.lock().last_index()
    }

    /// Term of the last entry, or 0 when the log is empty.
    pub fn last_term(&self) -> Result<Term> {
        let mut inner = self.inner.lock();
        let last = inner.last_index();
        Ok(inner.read(last)?.map(|e| e.term).unwrap_or(0))
    }

    /// Index of the first retained entry.
    pub fn start_index(&self) -> LogIndex {
        self.inner.lock().start_index()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of read-only segments.
    pub fn sealed_segment_count(&self) -> usize {
        self.inner.lock().sealed.len()
    }

    /// Total number of segments, active included.
    pub fn segment_count(&self) -> usize {
        self.inner.lock().sealed.len() + 1
    }

    /// Discard every entry with index >= `index`.
    pub fn truncate_suffix(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        self.truncate_suffix_locked(&mut inner, index)
    }

    fn truncate_suffix_locked(&self, inner: &mut LogStoreInner, index: LogIndex) -> Result<()> {
        if index > inner.last_index() {
            return Ok(());
        }
        if index <= inner.start_index() {
            return self.reset_locked(inner, index.saturating_sub(1));
        }

        inner.cache.truncate_from(index);

        if index >= inner.active.start_index() {
            inner.active.truncate_from(index)?;
        } else {
            let doomed: Vec<LogIndex> = inner.sealed.range(index..).map(|(k, _)| *k).rev().collect();
            for start in doomed {
                if let Some(segment) = inner.sealed.remove(&start) {
                    segment.remove()?;
                }
            }

            // Re-activate the segment that now holds the tail.
            match inner.sealed.pop_last() {
                Some((_, mut tail)) => {
                    tail.truncate_from(index)?;
                    let old_active = std::mem::replace(&mut inner.active, tail);
                    old_active.remove()?;
                }
                None => return self.reset_locked(inner, index - 1),
            }
        }

        debug!(from = index, last_index = inner.last_index(), "Truncated log suffix");
        Ok(())
    }

    /// Discard every entry with index <= `index`.
    ///
    /// Segments wholly below the cut are deleted; a segment straddling it is
    /// copied forward into a new segment named after `index + 1`.
    pub fn truncate_prefix(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        if index < inner.start_index() {
            return Ok(());
        }
        if index >= inner.last_index() {
            return self.reset_locked(&mut inner, index);
        }

        inner.cache.truncate_through(index);

        let below: Vec<LogIndex> = inner
            .sealed
            .iter()
            .filter(|(_, s)| s.last_index() <= index)
            .map(|(k, _)| *k)
            .collect();
        for start in below {
            if let Some(segment) = inner.sealed.remove(&start) {
                segment.remove()?;
            }
        }

        let new_start = index + 1;
        let straddler = inner
            .sealed
            .iter()
            .next()
            .map(|(k, s)| (*k, s.start_index() < new_start))
            .filter(|(_, straddles)| *straddles)
            .map(|(k, _)| k);

        match straddler {
            Some(start) => {
                if let Some(mut segment) = inner.sealed.remove(&start) {
                    let rewritten = self.copy_forward(&mut segment, new_start)?;
                    segment.remove()?;
                    inner.sealed.insert(new_start, rewritten);
                }
            }
            None if inner.sealed.is_empty() && inner.active.start_index() < new_start => {
                let rewritten = self.copy_forward(&mut inner.active, new_start)?;
                let old = std::mem::replace(&mut inner.active, rewritten);
                old.remove()?;
            }
            None => {}
        }

        info!(
            through = index,
            start_index = inner.start_index(),
            segments = inner.sealed.len() + 1,
            "Truncated log prefix"
        );
        Ok(())
    }

    fn copy_forward(&self, segment: &mut Segment, new_start: LogIndex) -> Result<Segment> {
        let kept = segment.read_from(new_start)?;
        let mut rewritten = Segment::create_staged(&self.dir, new_start)?;
        rewritten.append_all(&kept)?;
        rewritten.publish()?;
        Ok(rewritten)
    }

    /// Drop every segment; the next entry written gets `last_index + 1`.
    pub fn reset(&self, last_index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        self.reset_locked(&mut inner, last_index)
    }

    fn reset_locked(&self, inner: &mut LogStoreInner, last_index: LogIndex) -> Result<()> {
        let start = last_index + 1;
        inner.cache.clear();

        let sealed = std::mem::take(&mut inner.sealed);
        for (_, segment) in sealed.into_iter().rev() {
            segment.remove()?;
        }

        if inner.active.start_index() == start {
            inner.active.truncate_from(start)?;
        } else {
            let fresh = Segment::create(&self.dir, start)?;
            let old = std::mem::replace(&mut inner.active, fresh);
            old.remove()?;
        }

        info!(last_index, "Reset log");
        Ok(())
    }
}
