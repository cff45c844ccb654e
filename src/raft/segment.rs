//! One on-disk log segment.
//!
//! A segment covers a contiguous `[start_index, last_index]` range and is
//! backed by two files named after its start index:
//!
//! - `<start>.log`: records of `u32 length | encoded entry`
//! - `<start>.index`: fixed 16-byte records of `i64 index | i64 data_offset`
//!
//! All integers are big-endian.

use super::log::LogEntry;
use crate::codec::{read_frame, write_frame, WireMessage, FRAME_HEADER_LEN};
use crate::error::{RaftError, Result};
use crate::types::LogIndex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Size of one index-file record.
pub const INDEX_RECORD_LEN: u64 = 16;

const DATA_EXT: &str = "log";
const INDEX_EXT: &str = "index";
const STAGED_SUFFIX: &str = ".tmp";

/// A single segment of the replicated log.
#[derive(Debug)]
pub struct Segment {
    dir: PathBuf,
    start_index: LogIndex,
    entry_count: u64,
    data: File,
    index: File,
    data_len: u64,
    staged: bool,
}

impl Segment {
    /// Path of the data file for a segment starting at `start_index`.
    pub fn data_path(dir: &Path, start_index: LogIndex) -> PathBuf {
        dir.join(format!("{}.{}", start_index, DATA_EXT))
    }

    /// Path of the index file for a segment starting at `start_index`.
    pub fn index_path(dir: &Path, start_index: LogIndex) -> PathBuf {
        dir.join(format!("{}.{}", start_index, INDEX_EXT))
    }

    fn staged_path(path: PathBuf) -> PathBuf {
        let mut name = path.into_os_string();
        name.push(STAGED_SUFFIX);
        PathBuf::from(name)
    }

    /// Parse a segment start index from a `<start>.log` file name.
    pub fn parse_start(file_name: &str) -> Option<LogIndex> {
        file_name
            .strip_suffix(".log")
            .and_then(|stem| stem.parse::<LogIndex>().ok())
    }

    /// Whether a file name belongs to a staged or orphaned segment file.
    pub fn is_staged_file(file_name: &str) -> bool {
        file_name.ends_with(STAGED_SUFFIX)
    }

    /// Create a new, empty segment, replacing any files of the same name.
    pub fn create(dir: &Path, start_index: LogIndex) -> Result<Self> {
        Self::create_at(dir, start_index, false)
    }

    /// Create an empty segment under temporary names.
    ///
    /// The segment becomes visible to recovery only after [`Segment::publish`].
    pub fn create_staged(dir: &Path, start_index: LogIndex) -> Result<Self> {
        Self::create_at(dir, start_index, true)
    }

    fn create_at(dir: &Path, start_index: LogIndex, staged: bool) -> Result<Self> {
        if start_index == 0 {
            return Err(RaftError::Internal("segment start index must be >= 1".into()));
        }
        let (data_path, index_path) = Self::paths(dir, start_index, staged);
        let data = open_rw(&data_path, true)?;
        let index = open_rw(&index_path, true)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            start_index,
            entry_count: 0,
            data,
            index,
            data_len: 0,
            staged,
        })
    }

    /// Reopen an existing segment, cutting back any torn tail.
    ///
    /// The index file is the source of truth: a record survives only if its
    /// index is the next expected one, its offset is where the previous record
    /// ended, and the full data record is on disk.
    pub fn open(dir: &Path, start_index: LogIndex) -> Result<Self> {
        let (data_path, index_path) = Self::paths(dir, start_index, false);
        let mut data = open_rw(&data_path, false)?;
        let mut index = open_rw(&index_path, false)?;

        let data_disk_len = data.metadata()?.len();
        let index_disk_len = index.metadata()?.len();
        let candidates = index_disk_len / INDEX_RECORD_LEN;

        let mut valid = 0u64;
        let mut data_end = 0u64;
        index.seek(SeekFrom::Start(0))?;
        for i in 0..candidates {
            let (idx, offset) = read_index_record(&mut index)?;
            if idx != start_index + i || offset != data_end {
                break;
            }
            if offset + FRAME_HEADER_LEN as u64 > data_disk_len {
                break;
            }
            data.seek(SeekFrom::Start(offset))?;
            let mut len_buf = [0u8; FRAME_HEADER_LEN];
            data.read_exact(&mut len_buf)?;
            let end = offset + FRAME_HEADER_LEN as u64 + u32::from_be_bytes(len_buf) as u64;
            if end > data_disk_len {
                break;
            }
            data_end = end;
            valid += 1;
        }

        if valid * INDEX_RECORD_LEN != index_disk_len || data_end != data_disk_len {
            warn!(
                segment = start_index,
                kept = valid,
                index_bytes = index_disk_len,
                data_bytes = data_disk_len,
                "Cutting torn tail from log segment"
            );
            index.set_len(valid * INDEX_RECORD_LEN)?;
            data.set_len(data_end)?;
            index.sync_data()?;
            data.sync_data()?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            start_index,
            entry_count: valid,
            data,
            index,
            data_len: data_end,
            staged: false,
        })
    }

    fn paths(dir: &Path, start_index: LogIndex, staged: bool) -> (PathBuf, PathBuf) {
        let data = Self::data_path(dir, start_index);
        let index = Self::index_path(dir, start_index);
        if staged {
            (Self::staged_path(data), Self::staged_path(index))
        } else {
            (data, index)
        }
    }

    /// First index this segment covers.
    pub fn start_index(&self) -> LogIndex {
        self.start_index
    }

    /// Last stored index, or `start_index - 1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.start_index + self.entry_count - 1
    }

    /// Index the next append must carry.
    pub fn next_index(&self) -> LogIndex {
        self.start_index + self.entry_count
    }

    pub fn len(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Size of the data file in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_len
    }

    pub fn contains(&self, index: LogIndex) -> bool {
        index >= self.start_index && index < self.next_index()
    }

    /// Append one entry and flush both files before returning.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        self.write_entry(entry)?;
        self.sync()
    }

    /// Append several entries with a single flush at the end.
    pub fn append_all(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.write_entry(entry)?;
        }
        self.sync()
    }

    fn write_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(RaftError::LogGap {
                expected,
                got: entry.index,
            });
        }

        let payload = entry.encode()?;
        self.data.seek(SeekFrom::Start(self.data_len))?;
        let written = write_frame(&mut self.data, &payload)?;

        let mut record = [0u8; INDEX_RECORD_LEN as usize];
        record[..8].copy_from_slice(&(entry.index as i64).to_be_bytes());
        record[8..].copy_from_slice(&(self.data_len as i64).to_be_bytes());
        self.index
            .seek(SeekFrom::Start(self.entry_count * INDEX_RECORD_LEN))?;
        self.index.write_all(&record)?;

        self.data_len += written;
        self.entry_count += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.data.sync_data()?;
        self.index.sync_data()?;
        Ok(())
    }

    /// Read the entry at `index`.
    pub fn read(&mut self, index: LogIndex) -> Result<LogEntry> {
        if !self.contains(index) {
            return Err(RaftError::LogIndexOutOfRange {
                index,
                first: self.start_index,
                last: self.last_index(),
            });
        }

        let offset = self.offset_of(index)?;
        self.data.seek(SeekFrom::Start(offset))?;
        let payload = read_frame(&mut self.data)?.ok_or_else(|| {
            RaftError::DataCorruption(format!(
                "segment {} record {} is truncated",
                self.start_index, index
            ))
        })?;

        let entry = LogEntry::decode(&payload)?;
        if entry.index != index {
            return Err(RaftError::DataCorruption(format!(
                "segment {} holds index {} at slot {}",
                self.start_index, entry.index, index
            )));
        }
        Ok(entry)
    }

    /// Read every entry from `from` to the end of the segment.
    pub fn read_from(&mut self, from: LogIndex) -> Result<Vec<LogEntry>> {
        let first = from.max(self.start_index);
        let mut entries = Vec::with_capacity(self.next_index().saturating_sub(first) as usize);
        for index in first..self.next_index() {
            entries.push(self.read(index)?);
        }
        Ok(entries)
    }

    fn offset_of(&mut self, index: LogIndex) -> Result<u64> {
        let slot = index - self.start_index;
        self.index.seek(SeekFrom::Start(slot * INDEX_RECORD_LEN))?;
        let (stored, offset) = read_index_record(&mut self.index)?;
        if stored != index {
            return Err(RaftError::DataCorruption(format!(
                "segment {} index slot {} names entry {}",
                self.start_index, slot, stored
            )));
        }
        Ok(offset)
    }

    /// Discard every entry with index >= `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index >= self.next_index() {
            return Ok(());
        }

        let keep = index.saturating_sub(self.start_index);
        let new_data_len = if keep == 0 {
            0
        } else {
            self.offset_of(self.start_index + keep)?
        };

        self.index.set_len(keep * INDEX_RECORD_LEN)?;
        self.data.set_len(new_data_len)?;
        self.sync()?;

        self.entry_count = keep;
        self.data_len = new_data_len;
        Ok(())
    }

    /// Move a staged segment to its final file names.
    ///
    /// The index file is renamed first so recovery, which discovers segments
    /// through their data files, never sees a data file without its index.
    pub fn publish(&mut self) -> Result<()> {
        if !self.staged {
            return Ok(());
        }
        self.sync()?;
        let (staged_data, staged_index) = Self::paths(&self.dir, self.start_index, true);
        let (data, index) = Self::paths(&self.dir, self.start_index, false);
        fs::rename(&staged_index, &index)?;
        fs::rename(&staged_data, &data)?;
        self.staged = false;
        Ok(())
    }

    /// Delete this segment's files.
    pub fn remove(self) -> Result<()> {
        let (data, index) = Self::paths(&self.dir, self.start_index, self.staged);
        drop(self.data);
        drop(self.index);
        remove_if_exists(&data)?;
        remove_if_exists(&index)?;
        Ok(())
    }
}

fn open_rw(path: &Path, truncate: bool) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)?)
}

fn read_index_record(file: &mut File) -> Result<(LogIndex, u64)> {
    let mut record = [0u8; INDEX_RECORD_LEN as usize];
    file.read_exact(&mut record)?;
    let mut index = [0u8; 8];
    let mut offset = [0u8; 8];
    index.copy_from_slice(&record[..8]);
    offset.copy_from_slice(&record[8..]);
    Ok((
        i64::from_be_bytes(index) as LogIndex,
        i64::from_be_bytes(offset) as u64,
    ))
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
