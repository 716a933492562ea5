//! Record Executor
//!
//! Turns binlog records into wire requests for one peer and decides which
//! peer answers count as success.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::pool::{RecordSyncer, SkipReason, SyncOutcome};
use crate::binlog::{BinlogPosition, BinlogRecord, Extent, OpKind};
use crate::error::{Error, Result};
use crate::network::{ConnectionPool, PeerConnection};
use crate::protocol::{FileInfo, Response, StatusVerdict, SyncRequest};
use crate::storage::FileStore;

/// File content is streamed in chunks of this size
const CONTENT_CHUNK_SIZE: u64 = 256 * 1024;

/// Replicates records to one peer over pooled connections
pub struct PeerSyncer {
    group_name: String,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn FileStore>,
    /// Whether the latest copy in binlog order found the file already at
    /// the peer, with that record's position
    last_file_exist: Mutex<Option<(BinlogPosition, bool)>>,
    bytes_sent: AtomicU64,
}

impl PeerSyncer {
    pub fn new(group_name: String, pool: Arc<ConnectionPool>, store: Arc<dyn FileStore>) -> Self {
        Self {
            group_name,
            pool,
            store,
            last_file_exist: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// File content bytes sent so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn last_file_exist(&self) -> bool {
        let last = self.last_file_exist.lock().unwrap_or_else(|e| e.into_inner());
        last.map_or(false, |(_, exists)| exists)
    }

    /// Record a copy result unless a later record already did
    fn note_file_exist(&self, at: BinlogPosition, exists: bool) {
        let mut last = self.last_file_exist.lock().unwrap_or_else(|e| e.into_inner());
        if last.map_or(true, |(seen, _)| seen <= at) {
            *last = Some((at, exists));
        }
    }

    /// Send one request and classify the answer.
    ///
    /// The connection goes back to the pool unless the exchange broke it.
    async fn request(&self, request: &SyncRequest) -> Result<(StatusVerdict, Response)> {
        let mut conn = self.pool.checkout().await?;
        match self.exchange(&mut conn, request).await {
            Ok(response) => {
                self.pool.checkin(conn).await;
                let verdict = request.verdict(response.status);
                if let StatusVerdict::Rejected(status) = verdict {
                    return Err(Error::PeerStatus {
                        peer: self.pool.peer().id.clone(),
                        cmd: request.cmd(),
                        status,
                    });
                }
                Ok((verdict, response))
            }
            Err(e) => {
                tracing::debug!("Dropping connection to {} after {} failed: {}", conn.address(), request.name(), e);
                Err(e)
            }
        }
    }

    async fn exchange(&self, conn: &mut PeerConnection, request: &SyncRequest) -> Result<Response> {
        conn.send(&request.encode_head(&self.group_name)).await?;

        if let (Some(filename), Some((offset, length))) = (request.content_filename(), request.content_range()) {
            let mut sent = 0;
            while sent < length {
                let chunk = CONTENT_CHUNK_SIZE.min(length - sent);
                let store = Arc::clone(&self.store);
                let name = filename.to_string();
                let at = offset + sent;
                let data = tokio::task::spawn_blocking(move || store.read_range(&name, at, chunk))
                    .await
                    .map_err(|e| Error::Network(format!("content read task failed: {}", e)))??;
                conn.send(&data).await?;
                sent += chunk;
            }
            self.bytes_sent.fetch_add(length, Ordering::Relaxed);
        }

        conn.recv_response().await
    }

    fn outcome(verdict: StatusVerdict) -> SyncOutcome {
        match verdict {
            StatusVerdict::Benign => SyncOutcome::AlreadyPresent,
            _ => SyncOutcome::Synced,
        }
    }

    /// Create or update the whole file at the peer
    async fn copy_file(
        &self,
        record: &BinlogRecord,
        at: BinlogPosition,
        filename: &str,
        mut update: bool,
    ) -> Result<SyncOutcome> {
        let Some(stat) = self.store.stat_file(filename)? else {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceMissing));
        };

        let mut exists = false;
        if !update && self.last_file_exist() {
            let query = SyncRequest::QueryFileInfo {
                filename: filename.to_string(),
            };
            let (verdict, response) = self.request(&query).await?;
            if verdict == StatusVerdict::Done {
                let info = FileInfo::decode(&response)?;
                if info.size == stat.size {
                    tracing::debug!("Peer {} already has {} ({} bytes)", self.pool.peer(), filename, info.size);
                    exists = true;
                } else {
                    update = true;
                }
            }
        }

        let copy = SyncRequest::Copy {
            update,
            exists,
            timestamp: record.timestamp,
            filename: filename.to_string(),
            size: stat.size,
        };
        let (verdict, _) = self.request(&copy).await?;
        self.note_file_exist(at, exists || verdict == StatusVerdict::Benign);
        if exists {
            return Ok(SyncOutcome::AlreadyPresent);
        }
        Ok(Self::outcome(verdict))
    }

    async fn sync_range(
        &self,
        record: &BinlogRecord,
        at: BinlogPosition,
        modify: bool,
        offset: u64,
        length: u64,
    ) -> Result<SyncOutcome> {
        let Some(stat) = self.store.stat_file(&record.filename)? else {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceMissing));
        };
        if stat.size < offset.saturating_add(length) {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceShrunk));
        }

        let request = SyncRequest::Range {
            modify,
            timestamp: record.timestamp,
            filename: record.filename.clone(),
            offset,
            length,
        };
        match self.request(&request).await?.0 {
            StatusVerdict::Missing => {
                tracing::debug!("Peer {} lacks {}, sending the whole file", self.pool.peer(), record.filename);
                self.copy_file(record, at, &record.filename, true).await
            }
            verdict => Ok(Self::outcome(verdict)),
        }
    }

    async fn sync_truncate(&self, record: &BinlogRecord, at: BinlogPosition, old_size: u64, new_size: u64) -> Result<SyncOutcome> {
        if self.store.stat_file(&record.filename)?.is_none() {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceMissing));
        }

        let request = SyncRequest::Truncate {
            timestamp: record.timestamp,
            filename: record.filename.clone(),
            old_size,
            new_size,
        };
        match self.request(&request).await?.0 {
            StatusVerdict::Missing => self.copy_file(record, at, &record.filename, true).await,
            verdict => Ok(Self::outcome(verdict)),
        }
    }

    async fn sync_delete(&self, record: &BinlogRecord) -> Result<SyncOutcome> {
        if self.store.lstat_file(&record.filename)?.is_some() {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceRecreated));
        }

        let request = SyncRequest::Delete {
            timestamp: record.timestamp,
            filename: record.filename.clone(),
        };
        Ok(Self::outcome(self.request(&request).await?.0))
    }

    async fn sync_rename(&self, record: &BinlogRecord, at: BinlogPosition, src: &str) -> Result<SyncOutcome> {
        let request = SyncRequest::Rename {
            timestamp: record.timestamp,
            dest: record.filename.clone(),
            src: src.to_string(),
        };
        match self.request(&request).await?.0 {
            StatusVerdict::Missing => {
                tracing::debug!(
                    "Peer {} lacks rename source {}, copying {}",
                    self.pool.peer(),
                    src,
                    record.filename
                );
                self.copy_file(record, at, &record.filename, false).await
            }
            verdict => Ok(Self::outcome(verdict)),
        }
    }

    async fn sync_link(&self, record: &BinlogRecord, at: BinlogPosition) -> Result<SyncOutcome> {
        if self.store.lstat_file(&record.filename)?.is_none() {
            return Ok(SyncOutcome::Skipped(SkipReason::SourceMissing));
        }

        let src = match &record.src_filename {
            Some(src) => src.clone(),
            None => match self.store.resolve_link(&record.filename)? {
                Some(src) => src,
                // Replaced by a regular file since
                None => return self.copy_file(record, at, &record.filename, false).await,
            },
        };

        let request = SyncRequest::Link {
            timestamp: record.timestamp,
            dest: record.filename.clone(),
            src,
        };
        Ok(Self::outcome(self.request(&request).await?.0))
    }
}

#[async_trait]
impl RecordSyncer for PeerSyncer {
    async fn sync_record(&self, record: &BinlogRecord, at: BinlogPosition) -> Result<SyncOutcome> {
        let op = record.op_type;
        if !op.is_source() && !op.is_forwardable_replica() {
            return Ok(SyncOutcome::Skipped(SkipReason::NotForwarded));
        }

        match (op.kind(), record.extent, record.src_filename.as_deref()) {
            (OpKind::Create, _, _) => self.copy_file(record, at, &record.filename, false).await,
            (OpKind::Update, _, _) => self.copy_file(record, at, &record.filename, true).await,
            (OpKind::Append, Some(Extent::Range { offset, length }), _) => {
                self.sync_range(record, at, false, offset, length).await
            }
            (OpKind::Modify, Some(Extent::Range { offset, length }), _) => {
                self.sync_range(record, at, true, offset, length).await
            }
            (OpKind::Truncate, Some(Extent::Resize { old_size, new_size }), _) => {
                self.sync_truncate(record, at, old_size, new_size).await
            }
            (OpKind::Delete, _, _) => self.sync_delete(record).await,
            (OpKind::Rename, _, Some(src)) => self.sync_rename(record, at, src).await,
            (OpKind::Link, _, _) => self.sync_link(record, at).await,
            _ => Err(Error::Protocol(format!("record cannot be replicated: {}", record))),
        }
    }
}
