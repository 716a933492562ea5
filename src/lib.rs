//! WolfSync - Binlog Replication Engine for Storage Nodes
//!
//! Replicates file mutations between the storage nodes of a group. Every
//! local write is recorded in an append-only binlog; one sync session per
//! peer tails that log and replays the operations against the peer over a
//! small binary protocol.
//!
//! # Architecture
//!
//! The binlog is split into size-rotated segments. Each peer session owns a
//! reader cursor that is checkpointed in a mark file, so a restarted node
//! resumes exactly where the peer was last confirmed. Records touching
//! disjoint files are grouped into batches and sent in parallel; records for
//! the same file are always sent in log order.
//!
//! # Features
//!
//! - Line-oriented binlog with rotation and optional LZ4 archiving
//! - Crash-safe per-peer checkpoints
//! - Conflict-free parallel dispatch with exact rewind on failure
//! - Historical replay for new peers
//! - Benign handling of "already exists" / "not found" peer answers

pub mod binlog;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::binlog::{BinlogPosition, BinlogReader, BinlogRecord, BinlogWriter, OpType};
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::{Connector, TcpConnector};
    pub use crate::state::{Membership, PeerInfo, PeerStatus, ReplayPlan, StaticMembership};
    pub use crate::storage::{FileStore, LocalFileStore};
    pub use crate::sync::{ShutdownSignal, SyncManager};
}
