//! Snapshot files, building and the chunked transfer receiver.
//!
//! A snapshot file is a 24-byte header followed by the application payload:
//!
//! ```text
//! u32 version | u32 magic | i64 last_included_index | i64 last_included_term | payload...
//! ```
//!
//! All header fields are big-endian. Complete snapshots are stored as
//! `<last_included_index>.snap`; builds in progress use `.snap.tmp` and
//! incoming transfers `.snap.partial`.

use super::rpc::InstallSnapshotRequest;
use super::segment::remove_if_exists;
use super::StateMachine;
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, NodeId, Term};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;
/// Magic number identifying snapshot files ("RSNP").
pub const SNAPSHOT_MAGIC: u32 = u32::from_be_bytes(*b"RSNP");
/// Size of the fixed header.
pub const HEADER_LEN: usize = 24;

const SNAP_EXT: &str = ".snap";
const TMP_EXT: &str = ".snap.tmp";
const PARTIAL_EXT: &str = ".snap.partial";

/// Fixed snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub magic: u32,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}

impl SnapshotHeader {
    pub fn new(last_included_index: LogIndex, last_included_term: Term) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            magic: SNAPSHOT_MAGIC,
            last_included_index,
            last_included_term,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.magic.to_be_bytes());
        buf[8..16].copy_from_slice(&(self.last_included_index as i64).to_be_bytes());
        buf[16..24].copy_from_slice(&(self.last_included_term as i64).to_be_bytes());
        buf
    }

    /// Parse and validate a header. Version and magic must match.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let i64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            i64::from_be_bytes(raw)
        };

        let header = Self {
            version: u32_at(0),
            magic: u32_at(4),
            last_included_index: i64_at(8) as LogIndex,
            last_included_term: i64_at(16) as Term,
        };

        if header.magic != SNAPSHOT_MAGIC {
            return Err(RaftError::SnapshotHeader(format!(
                "bad magic {:#010x}",
                header.magic
            )));
        }
        if header.version != SNAPSHOT_VERSION {
            return Err(RaftError::SnapshotHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }

    /// Read and validate a header from the start of a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                RaftError::SnapshotHeader("file shorter than header".into())
            } else {
                RaftError::Io(e)
            }
        })?;
        Self::parse(&buf)
    }
}

/// A complete snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub path: PathBuf,
    /// File size, header included.
    pub size: u64,
}

/// Writes a new snapshot file. The payload is pushed through [`Write`].
///
/// Dropping a writer without calling [`SnapshotWriter::finish`] discards it.
pub struct SnapshotWriter {
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    header: SnapshotHeader,
}

impl SnapshotWriter {
    /// Start a snapshot in `dir` and write its header.
    pub fn create(dir: &Path, last_included_index: LogIndex, last_included_term: Term) -> Result<Self> {
        let tmp_path = dir.join(format!("{}{}", last_included_index, TMP_EXT));
        let final_path = dir.join(format!("{}{}", last_included_index, SNAP_EXT));
        let header = SnapshotHeader::new(last_included_index, last_included_term);

        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(&header.to_bytes())?;

        Ok(Self {
            file: Some(file),
            tmp_path,
            final_path,
            header,
        })
    }

    /// Flush, sync and atomically move the file into place.
    pub fn finish(mut self) -> Result<SnapshotMeta> {
        let file = self
            .file
            .take()
            .ok_or_else(|| RaftError::Internal("snapshot writer already closed".into()))?;
        let file = file
            .into_inner()
            .map_err(|e| RaftError::Io(e.into_error()))?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(SnapshotMeta {
            last_included_index: self.header.last_included_index,
            last_included_term: self.header.last_included_term,
            path: self.final_path.clone(),
            size,
        })
    }

    /// Remove the partially written file.
    pub fn discard(mut self) -> Result<()> {
        self.file.take();
        remove_if_exists(&self.tmp_path)
    }
}

impl Write for SnapshotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "snapshot writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Reads a validated snapshot. [`Read`] yields the payload only.
pub struct SnapshotReader {
    header: SnapshotHeader,
    reader: BufReader<File>,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RaftError::SnapshotNotFound(path.display().to_string())
            } else {
                RaftError::Io(e)
            }
        })?;
        let mut reader = BufReader::new(file);
        let header = SnapshotHeader::read_from(&mut reader)?;
        Ok(Self { header, reader })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Directory of snapshot files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open the directory, dropping abandoned builds.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.to_string_lossy().ends_with(TMP_EXT) {
                debug!(path = %path.display(), "Removing abandoned snapshot build");
                remove_if_exists(&path)?;
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new snapshot.
    pub fn writer(&self, last_included_index: LogIndex, last_included_term: Term) -> Result<SnapshotWriter> {
        SnapshotWriter::create(&self.dir, last_included_index, last_included_term)
    }

    fn complete_indices(&self) -> Result<Vec<LogIndex>> {
        let mut indices = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let name = dir_entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = name.strip_suffix(SNAP_EXT).and_then(|s| s.parse().ok()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Newest complete snapshot with a valid header.
    pub fn latest(&self) -> Result<Option<SnapshotMeta>> {
        for index in self.complete_indices()?.into_iter().rev() {
            let path = self.dir.join(format!("{}{}", index, SNAP_EXT));
            match self.describe(&path) {
                Ok(meta) => return Ok(Some(meta)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(None)
    }

    /// Read the header of a snapshot file into a [`SnapshotMeta`].
    pub fn describe(&self, path: &Path) -> Result<SnapshotMeta> {
        let reader = SnapshotReader::open(path)?;
        let size = fs::metadata(path)?.len();
        let header = *reader.header();
        Ok(SnapshotMeta {
            last_included_index: header.last_included_index,
            last_included_term: header.last_included_term,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Delete every complete snapshot older than `index`.
    pub fn remove_older_than(&self, index: LogIndex) -> Result<()> {
        for old in self.complete_indices()?.into_iter().filter(|i| *i < index) {
            remove_if_exists(&self.dir.join(format!("{}{}", old, SNAP_EXT)))?;
        }
        Ok(())
    }
}

/// Decides when to build a snapshot and builds it.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    distance: u64,
}

impl SnapshotBuilder {
    pub fn new(distance: u64) -> Self {
        Self { distance }
    }

    /// Whether a snapshot as of `last_applied` is due.
    ///
    /// Nothing is built unless `last_applied` moved past the current snapshot.
    pub fn should_build(
        &self,
        last_applied: LogIndex,
        last_snapshot_index: LogIndex,
        log_start: LogIndex,
        requested: bool,
    ) -> bool {
        if last_applied <= last_snapshot_index {
            return false;
        }
        requested || last_applied.saturating_sub(log_start) > self.distance
    }

    /// Write a snapshot of `state_machine` as of `index`.
    pub fn build<S: StateMachine + ?Sized>(
        &self,
        store: &SnapshotStore,
        state_machine: &S,
        index: LogIndex,
        term: Term,
    ) -> Result<SnapshotMeta> {
        let mut writer = store.writer(index, term)?;
        if let Err(e) = state_machine.build_snapshot(&mut writer, index) {
            writer.discard()?;
            return Err(e);
        }
        writer.finish()
    }
}

/// Result of handling one InstallSnapshot chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Chunk stored (or ignored); the follower now holds `bytes_stored` bytes.
    Stored { bytes_stored: u64 },
    /// The final chunk arrived and the file is in place.
    Complete { meta: SnapshotMeta },
    /// The completed file failed header validation and was deleted.
    Rejected,
}

struct Incoming {
    term: Term,
    last_included_index: LogIndex,
    last_included_term: Term,
    path: PathBuf,
    file: File,
    bytes_stored: u64,
}

/// Follower-side state of an incoming snapshot transfer.
///
/// The partial file is named after the snapshot and the sending leader's
/// term, so a restarted follower resumes only a transfer of the same file.
pub struct SnapshotReceiver {
    dir: PathBuf,
    incoming: Option<Incoming>,
}

impl SnapshotReceiver {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            incoming: None,
        }
    }

    fn partial_path(&self, index: LogIndex, leader: NodeId, term: Term) -> PathBuf {
        self.dir
            .join(format!("{}-{}-{}{}", index, leader, term, PARTIAL_EXT))
    }

    /// Bytes of the transfer in progress, 0 when idle.
    pub fn bytes_stored(&self) -> u64 {
        self.incoming.as_ref().map(|i| i.bytes_stored).unwrap_or(0)
    }

    pub fn is_receiving(&self) -> bool {
        self.incoming.is_some()
    }

    /// Abandon the transfer in progress and delete its file.
    pub fn discard(&mut self) -> Result<()> {
        if let Some(incoming) = self.incoming.take() {
            debug!(
                index = incoming.last_included_index,
                bytes = incoming.bytes_stored,
                "Discarding incoming snapshot"
            );
            drop(incoming.file);
            remove_if_exists(&incoming.path)?;
        }
        Ok(())
    }

    fn begin(&mut self, request: &InstallSnapshotRequest) -> Result<()> {
        let path = self.partial_path(request.last_included_index, request.leader_id, request.term);

        // Partials of any other transfer can never be resumed.
        for dir_entry in fs::read_dir(&self.dir)? {
            let other = dir_entry?.path();
            if other != path && other.to_string_lossy().ends_with(PARTIAL_EXT) {
                remove_if_exists(&other)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes_stored = file.metadata()?.len();
        if bytes_stored > 0 && bytes_stored < HEADER_LEN as u64 {
            file.set_len(0)?;
            bytes_stored = 0;
        }
        if bytes_stored > 0 {
            info!(
                index = request.last_included_index,
                bytes_stored,
                "Resuming incoming snapshot"
            );
        }

        self.incoming = Some(Incoming {
            term: request.term,
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
            path,
            file,
            bytes_stored,
        });
        Ok(())
    }

    /// Handle one chunk.
    ///
    /// A chunk whose offset differs from the stored length is not written;
    /// the caller answers with the stored length so the leader resends from
    /// there.
    pub fn receive(&mut self, request: &InstallSnapshotRequest) -> Result<ReceiveOutcome> {
        let restart = match &self.incoming {
            Some(current) => {
                current.last_included_index != request.last_included_index
                    || current.last_included_term != request.last_included_term
                    || current.term != request.term
            }
            None => true,
        };
        if restart {
            self.discard()?;
            self.begin(request)?;
        }

        let incoming = match self.incoming.as_mut() {
            Some(incoming) => incoming,
            None => return Err(RaftError::Internal("snapshot transfer not started".into())),
        };

        if request.offset != incoming.bytes_stored {
            let mismatch = RaftError::SnapshotOffsetMismatch {
                stored: incoming.bytes_stored,
                received: request.offset,
            };
            debug!(error = %mismatch, "Ignoring snapshot chunk");
            return Ok(ReceiveOutcome::Stored {
                bytes_stored: incoming.bytes_stored,
            });
        }

        if !request.data.is_empty() {
            incoming.file.write_all(&request.data)?;
            incoming.file.sync_data()?;
            incoming.bytes_stored += request.data.len() as u64;
        }

        if !request.done {
            return Ok(ReceiveOutcome::Stored {
                bytes_stored: incoming.bytes_stored,
            });
        }

        self.complete()
    }

    fn complete(&mut self) -> Result<ReceiveOutcome> {
        let incoming = match self.incoming.take() {
            Some(incoming) => incoming,
            None => return Err(RaftError::Internal("snapshot transfer not started".into())),
        };
        let Incoming {
            last_included_index,
            last_included_term,
            path,
            file,
            bytes_stored,
            ..
        } = incoming;
        drop(file);

        let header = File::open(&path)
            .map_err(RaftError::from)
            .and_then(|mut f| SnapshotHeader::read_from(&mut f));
        match header {
            Ok(h)
                if h.last_included_index == last_included_index
                    && h.last_included_term == last_included_term =>
            {
                let final_path = self.dir.join(format!("{}{}", last_included_index, SNAP_EXT));
                fs::rename(&path, &final_path)?;
                info!(
                    index = last_included_index,
                    term = last_included_term,
                    bytes = bytes_stored,
                    "Received snapshot"
                );
                Ok(ReceiveOutcome::Complete {
                    meta: SnapshotMeta {
                        last_included_index,
                        last_included_term,
                        path: final_path,
                        size: bytes_stored,
                    },
                })
            }
            other => {
                match other {
                    Ok(h) => warn!(
                        expected = last_included_index,
                        found = h.last_included_index,
                        "Snapshot header does not match transfer"
                    ),
                    Err(e) => warn!(error = %e, "Rejecting received snapshot"),
                }
                remove_if_exists(&path)?;
                Ok(ReceiveOutcome::Rejected)
            }
        }
    }
}
