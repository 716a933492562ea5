//! WolfSync Configuration
//!
//! This module provides configuration structures for the binlog
//! replication engine embedded in a storage node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::GROUP_NAME_MAX_LEN;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Binlog configuration
    #[serde(default)]
    pub binlog: BinlogConfig,

    /// Peer synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Storage id of this node
    pub id: String,

    /// Replication group this node belongs to
    pub group_name: String,

    /// Base directory; the binlog lives under `<base_path>/data/sync`
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Store paths, index N is the logical `MNN` prefix of filenames
    #[serde(default)]
    pub store_paths: Vec<PathBuf>,

    /// Port peers listen on for replication traffic
    #[serde(default = "default_port")]
    pub port: u16,

    /// Key mark files by storage id instead of `ip_port`
    #[serde(default = "default_true")]
    pub use_storage_id: bool,
}

/// Binlog writer and reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogConfig {
    /// In-memory write buffer size in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Periodic flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Segment size that triggers rotation
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Compress sealed segments no reader references any more
    #[serde(default)]
    pub compress_old_segments: bool,

    /// Reader pre-read buffer size in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Peer synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum records dispatched in parallel to one peer
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Synced rows between two checkpoint writes
    #[serde(default = "default_write_mark_file_freq")]
    pub write_mark_file_freq: u64,

    /// Idle poll interval when the log has nothing new, in milliseconds
    #[serde(default = "default_sync_wait_ms")]
    pub sync_wait_ms: u64,

    /// Pause between two batches, in milliseconds (0 = none)
    #[serde(default)]
    pub sync_interval_ms: u64,

    /// Keepalive probe interval while idle, in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Peer connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Peer send/receive timeout in seconds
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    /// Idle pooled worker connections are closed after this many seconds
    #[serde(default = "default_worker_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,

    /// Skip undecodable binlog lines instead of stopping the session
    #[serde(default)]
    pub skip_invalid_record: bool,

    /// Start of the daily replication window ("HH:MM")
    #[serde(default = "default_sync_start_time")]
    pub sync_start_time: String,

    /// End of the daily replication window ("HH:MM")
    #[serde(default = "default_sync_end_time")]
    pub sync_end_time: String,

    /// Backoff after a failed batch or connection, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Hour and minute of day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    /// Parse "HH:MM"
    pub fn parse(value: &str) -> crate::Result<Self> {
        let (hour, minute) = value
            .split_once(':')
            .ok_or_else(|| crate::Error::Config(format!("invalid time of day: {}", value)))?;
        let hour: u32 = hour
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("invalid hour in: {}", value)))?;
        let minute: u32 = minute
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("invalid minute in: {}", value)))?;
        if hour > 23 || minute > 59 {
            return Err(crate::Error::Config(format!("time of day out of range: {}", value)));
        }
        Ok(Self { hour, minute })
    }

    /// Minutes since midnight
    pub fn minutes(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

// Default value functions
fn default_base_path() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync")
}

fn default_port() -> u16 {
    23000
}

fn default_true() -> bool {
    true
}

fn default_write_buffer_size() -> usize {
    16 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_segment_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_workers() -> usize {
    4
}

fn default_write_mark_file_freq() -> u64 {
    500
}

fn default_sync_wait_ms() -> u64 {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_network_timeout_secs() -> u64 {
    60
}

fn default_worker_idle_timeout_secs() -> u64 {
    60
}

fn default_sync_start_time() -> String {
    "00:00".to_string()
}

fn default_sync_end_time() -> String {
    "23:59".to_string()
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: default_write_buffer_size(),
            flush_interval_ms: default_flush_interval_ms(),
            segment_max_bytes: default_segment_max_bytes(),
            compress_old_segments: false,
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            write_mark_file_freq: default_write_mark_file_freq(),
            sync_wait_ms: default_sync_wait_ms(),
            sync_interval_ms: 0,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            network_timeout_secs: default_network_timeout_secs(),
            worker_idle_timeout_secs: default_worker_idle_timeout_secs(),
            skip_invalid_record: false,
            sync_start_time: default_sync_start_time(),
            sync_end_time: default_sync_end_time(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SyncConfig {
    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Replication window, or `None` when replication runs all day
    pub fn sync_window(&self) -> crate::Result<Option<(TimeOfDay, TimeOfDay)>> {
        let start = TimeOfDay::parse(&self.sync_start_time)?;
        let end = TimeOfDay::parse(&self.sync_end_time)?;
        let all_day = start.minutes() == 0 && end.minutes() >= 23 * 60 + 59;
        if all_day || start == end {
            Ok(None)
        } else {
            Ok(Some((start, end)))
        }
    }
}

impl BinlogConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.group_name.is_empty() || self.node.group_name.len() > GROUP_NAME_MAX_LEN {
            return Err(crate::Error::Config(format!(
                "node.group_name must be 1..={} bytes",
                GROUP_NAME_MAX_LEN
            )));
        }

        if self.node.store_paths.is_empty() {
            return Err(crate::Error::Config("node.store_paths cannot be empty".into()));
        }

        if self.sync.max_workers == 0 {
            return Err(crate::Error::Config("sync.max_workers must be at least 1".into()));
        }

        if self.binlog.segment_max_bytes == 0 {
            return Err(crate::Error::Config("binlog.segment_max_bytes cannot be 0".into()));
        }

        if self.binlog.write_buffer_size < 1024 {
            return Err(crate::Error::Config("binlog.write_buffer_size must be >= 1024".into()));
        }

        self.sync.sync_window()?;
        Ok(())
    }

    /// Get the binlog and mark file directory
    pub fn sync_dir(&self) -> PathBuf {
        self.node.base_path.join("data").join("sync")
    }

    /// Get flush interval as Duration
    pub fn flush_interval(&self) -> Duration {
        self.binlog.flush_interval()
    }
}
