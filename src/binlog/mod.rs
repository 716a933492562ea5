//! Binlog Module
//!
//! Append-only, line-oriented operation log. Every local file mutation is
//! appended here and each peer session replays it at its own pace.

pub mod record;
mod index;
mod writer;
mod reader;

pub use record::{BinlogRecord, Extent, OpKind, OpType};
pub use index::SegmentIndex;
pub use writer::BinlogWriter;
pub use reader::{BinlogReader, ReadRecord, ReadResult};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Position of a record boundary inside the segment sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Segment index
    pub index: u32,
    /// Byte offset inside the segment
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(index: u32, offset: u64) -> Self {
        Self { index, offset }
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.index, self.offset)
    }
}

/// Binlog directory structure
#[derive(Debug, Clone)]
pub struct BinlogPaths {
    pub base_dir: PathBuf,
}

impl BinlogPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for a specific segment file
    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.base_dir.join(format!("binlog.{:03}", index))
    }

    /// Get path for the compressed form of a sealed segment
    pub fn archive_path(&self, index: u32) -> PathBuf {
        self.base_dir.join(format!("binlog.{:03}.lz4", index))
    }

    /// Get path for the segment index
    pub fn index_path(&self) -> PathBuf {
        self.base_dir.join("binlog.index")
    }

    /// Get path for a peer's mark file
    pub fn mark_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.mark", key))
    }

    /// Ensure binlog directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}
