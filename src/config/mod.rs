//! Configuration module for the consensus engine.

use crate::error::{RaftError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Raft node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This node.
    pub node: PeerConfig,
    /// Every other voting member of the cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Base election timeout T; the timer is drawn from [T, 2T).
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    /// Heartbeat interval for idle leaders.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Deadline for a replicate() call to reach majority acknowledgment.
    #[serde(with = "humantime_serde")]
    pub replicate_timeout: Duration,
    /// Deadline for a single RPC to a peer.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Chunk size for InstallSnapshot streaming.
    pub snapshot_chunk_size: usize,
    /// Storage locations.
    pub storage: StorageConfig,
    /// Log store tuning.
    #[serde(default)]
    pub log: LogStoreConfig,
    /// Metadata store tuning.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Snapshot policy.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl RaftConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RaftError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            RaftError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(RaftError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == 0 || peer.id == self.node.id {
                return Err(RaftError::InvalidConfig {
                    field: "peers".to_string(),
                    reason: format!("Invalid peer id {}", peer.id),
                });
            }
            if !seen.insert(peer.id) {
                return Err(RaftError::InvalidConfig {
                    field: "peers".to_string(),
                    reason: format!("Duplicate peer id {}", peer.id),
                });
            }
        }

        if self.heartbeat_interval >= self.election_timeout {
            return Err(RaftError::InvalidConfig {
                field: "heartbeat_interval".to_string(),
                reason: "Heartbeat interval must be shorter than the election timeout".to_string(),
            });
        }

        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig {
                field: "max_entries_per_append".to_string(),
                reason: "Batch size must be non-zero".to_string(),
            });
        }

        if self.snapshot_chunk_size == 0 {
            return Err(RaftError::InvalidConfig {
                field: "snapshot_chunk_size".to_string(),
                reason: "Chunk size must be non-zero".to_string(),
            });
        }

        if self.log.max_segment_bytes == 0 {
            return Err(RaftError::InvalidConfig {
                field: "log.max_segment_bytes".to_string(),
                reason: "Segment size must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Ids of every peer, excluding this node.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// Number of voting members, including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Create a development configuration rooted at `base_dir`.
    pub fn development(node_id: NodeId, base_dir: &Path) -> Self {
        Self {
            node: PeerConfig {
                id: node_id,
                address: "127.0.0.1".to_string(),
                port: 9000 + node_id as u16,
            },
            peers: Vec::new(),
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(30),
            replicate_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_millis(500),
            max_entries_per_append: 100,
            snapshot_chunk_size: 100 * 1024,
            storage: StorageConfig::under(base_dir),
            log: LogStoreConfig::default(),
            metadata: MetadataConfig::default(),
            snapshot: SnapshotConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Address and identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Host name or IP address.
    pub address: String,
    /// RPC port.
    pub port: u16,
}

impl PeerConfig {
    /// `host:port` form of the address.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for log segments.
    pub log_dir: PathBuf,
    /// Directory for the metadata op-log generations.
    pub metadata_dir: PathBuf,
    /// Directory for snapshot files.
    pub snapshot_dir: PathBuf,
}

impl StorageConfig {
    /// Standard layout below a single base directory.
    pub fn under(base_dir: &Path) -> Self {
        Self {
            log_dir: base_dir.join("log"),
            metadata_dir: base_dir.join("metadata"),
            snapshot_dir: base_dir.join("snapshot"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::under(Path::new("/var/lib/strata-raft"))
    }
}

/// Log store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Data-file size after which the active segment is sealed.
    pub max_segment_bytes: u64,
    /// Byte budget of the in-memory tail cache.
    pub max_cache_bytes: usize,
    /// Sealed segment count that fires the snapshot request.
    pub max_sealed_segments: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 16 * 1024 * 1024,
            max_cache_bytes: 4 * 1024 * 1024,
            max_sealed_segments: 5,
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Op-log size after which a new generation is compacted.
    pub max_oplog_bytes: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_oplog_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Snapshot policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Build a snapshot once applied index minus log start exceeds this.
    pub distance: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { distance: 100_000 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
