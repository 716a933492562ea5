//! Mark files
//!
//! Durable per-peer checkpoint of a reader cursor, stored as `key=value`
//! lines next to the binlog.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::binlog::{BinlogPosition, BinlogRecord};
use crate::error::{Error, Result};
use crate::state::{PeerInfo, ReplayPlan};

const KEY_BINLOG_INDEX: &str = "binlog_index";
const KEY_BINLOG_OFFSET: &str = "binlog_offset";
const KEY_NEED_SYNC_OLD: &str = "need_sync_old";
const KEY_SYNC_OLD_DONE: &str = "sync_old_done";
const KEY_UNTIL_TIMESTAMP: &str = "until_timestamp";
const KEY_SCAN_ROW_COUNT: &str = "scan_row_count";
const KEY_SYNC_ROW_COUNT: &str = "sync_row_count";

/// Minimum number of keys of a valid mark file
const MIN_MARK_KEYS: usize = 7;

/// Replication progress towards one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderCursor {
    /// Next record to replicate; always a record boundary
    pub position: BinlogPosition,
    /// Records consumed, including skipped ones
    pub scan_row_count: u64,
    /// Records forwarded to the peer
    pub sync_row_count: u64,
    pub replay_old: bool,
    pub replay_done: bool,
    pub until_timestamp: i64,
}

impl ReaderCursor {
    /// Cursor for a peer that has never been synced
    pub fn fresh(plan: ReplayPlan) -> Self {
        Self {
            replay_old: plan.replay_old,
            until_timestamp: plan.until_timestamp,
            ..Default::default()
        }
    }

    /// Whether this peer needs the record.
    ///
    /// Source records always go out. Replica records are forwarded only while
    /// replaying history up to the cutoff.
    pub fn needs(&self, record: &BinlogRecord) -> bool {
        if record.op_type.is_source() {
            return true;
        }
        record.op_type.is_forwardable_replica()
            && self.replay_old
            && !self.replay_done
            && record.timestamp <= self.until_timestamp
    }

    pub fn to_text(&self) -> String {
        format!(
            "{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n",
            KEY_BINLOG_INDEX,
            self.position.index,
            KEY_BINLOG_OFFSET,
            self.position.offset,
            KEY_NEED_SYNC_OLD,
            self.replay_old as u8,
            KEY_SYNC_OLD_DONE,
            self.replay_done as u8,
            KEY_UNTIL_TIMESTAMP,
            self.until_timestamp,
            KEY_SCAN_ROW_COUNT,
            self.scan_row_count,
            KEY_SYNC_ROW_COUNT,
            self.sync_row_count
        )
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut cursor = ReaderCursor::default();
        let mut keys = 0;

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value: i64 = value
                .trim()
                .parse()
                .map_err(|_| Error::Checkpoint(format!("invalid mark line: {}", line)))?;
            let unsigned = |what: &str| {
                u64::try_from(value).map_err(|_| Error::Checkpoint(format!("negative {}: {}", what, value)))
            };

            match key.trim() {
                KEY_BINLOG_INDEX => {
                    cursor.position.index = u32::try_from(value)
                        .map_err(|_| Error::Checkpoint(format!("invalid binlog index: {}", value)))?;
                }
                KEY_BINLOG_OFFSET => cursor.position.offset = unsigned("binlog offset")?,
                KEY_NEED_SYNC_OLD => cursor.replay_old = value != 0,
                KEY_SYNC_OLD_DONE => cursor.replay_done = value != 0,
                KEY_UNTIL_TIMESTAMP => cursor.until_timestamp = value,
                KEY_SCAN_ROW_COUNT => cursor.scan_row_count = unsigned("scan row count")?,
                KEY_SYNC_ROW_COUNT => cursor.sync_row_count = unsigned("sync row count")?,
                _ => continue,
            }
            keys += 1;
        }

        if keys < MIN_MARK_KEYS {
            return Err(Error::Checkpoint(format!(
                "mark file has {} of {} keys",
                keys, MIN_MARK_KEYS
            )));
        }
        Ok(cursor)
    }
}

fn read_mark(path: &Path) -> Result<Option<ReaderCursor>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Checkpoint(format!("read {:?}: {}", path, e))),
    };
    ReaderCursor::parse(&content)
        .map(Some)
        .map_err(|e| Error::Checkpoint(format!("{:?}: {}", path, e)))
}

/// Directory of mark files, one per peer
#[derive(Debug, Clone)]
pub struct MarkStore {
    dir: PathBuf,
    use_storage_id: bool,
}

impl MarkStore {
    pub fn new(dir: PathBuf, use_storage_id: bool) -> Self {
        Self { dir, use_storage_id }
    }

    pub fn path_for(&self, peer: &PeerInfo) -> PathBuf {
        self.dir.join(format!("{}.mark", peer.mark_key(self.use_storage_id)))
    }

    fn legacy_path_for(&self, peer: &PeerInfo) -> PathBuf {
        self.dir.join(format!("{}.mark", peer.ip_port_key()))
    }

    /// Move an `ip_port` mark into place when marks are keyed by id
    fn migrate_legacy(&self, peer: &PeerInfo) -> Result<()> {
        if !self.use_storage_id {
            return Ok(());
        }
        let path = self.path_for(peer);
        let legacy = self.legacy_path_for(peer);
        if !path.exists() && legacy.exists() {
            std::fs::rename(&legacy, &path)
                .map_err(|e| Error::Checkpoint(format!("rename {:?} to {:?}: {}", legacy, path, e)))?;
            tracing::info!("Migrated mark file {:?} to {:?}", legacy, path);
        }
        Ok(())
    }

    /// Load a peer's cursor, `None` when it has no mark file
    pub fn load(&self, peer: &PeerInfo) -> Result<Option<ReaderCursor>> {
        self.migrate_legacy(peer)?;
        read_mark(&self.path_for(peer))
    }

    /// Read a peer's cursor without touching any file.
    ///
    /// Falls back to a not yet migrated `ip_port` mark. Returns the file read.
    pub fn peek(&self, peer: &PeerInfo) -> Result<Option<(PathBuf, ReaderCursor)>> {
        let mut candidates = vec![self.path_for(peer)];
        if self.use_storage_id {
            candidates.push(self.legacy_path_for(peer));
        }
        for path in candidates {
            if let Some(cursor) = read_mark(&path)? {
                return Ok(Some((path, cursor)));
            }
        }
        Ok(None)
    }

    /// Replace a peer's mark file (temp file, fsync, rename)
    pub fn save(&self, peer: &PeerInfo, cursor: &ReaderCursor) -> Result<()> {
        let path = self.path_for(peer);
        let tmp = path.with_extension("mark.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(cursor.to_text().as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };
        write().map_err(|e| Error::Checkpoint(format!("write {:?}: {}", path, e)))
    }

    /// Keep a deleted peer's mark under a timestamped name
    pub fn archive(&self, peer: &PeerInfo) -> Result<Option<PathBuf>> {
        let path = self.path_for(peer);
        if !path.exists() {
            return Ok(None);
        }
        let suffix = chrono::Local::now().format("%Y%m%d%H%M%S");
        let archived = self.dir.join(format!("{}.mark.{}", peer.mark_key(self.use_storage_id), suffix));
        std::fs::rename(&path, &archived)
            .map_err(|e| Error::Checkpoint(format!("archive {:?}: {}", path, e)))?;
        tracing::info!("Archived mark file of peer {} as {:?}", peer, archived);
        Ok(Some(archived))
    }

    /// Follow a peer to its new identity. Returns false when nothing moved.
    pub fn rename_for_ip_change(&self, old: &PeerInfo, new: &PeerInfo) -> Result<bool> {
        let from = self.path_for(old);
        let to = self.path_for(new);
        if from == to || !from.exists() {
            return Ok(false);
        }
        if to.exists() {
            tracing::warn!("Mark file {:?} already exists, keeping {:?}", to, from);
            return Ok(false);
        }
        std::fs::rename(&from, &to)
            .map_err(|e| Error::Checkpoint(format!("rename {:?} to {:?}: {}", from, to, e)))?;
        tracing::info!("Peer {} changed address, mark file moved to {:?}", new, to);
        Ok(true)
    }
}
