//! Peer Sync Session
//!
//! One long-running task per peer. It waits for the peer to become
//! synchronizable, sets up the checkpointed cursor, then loops building and
//! dispatching batches until the peer leaves or the node shuts down.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use rand::Rng;

use super::batch::BatchBuilder;
use super::executor::PeerSyncer;
use super::mark::{MarkStore, ReaderCursor};
use super::pool::{RecordSyncer, WorkerPool};
use super::ShutdownSignal;
use crate::binlog::{BinlogReader, BinlogWriter};
use crate::config::{NodeConfig, SyncConfig, TimeOfDay};
use crate::error::{Error, Result};
use crate::network::{ConnectionPool, Connector};
use crate::state::{Membership, PeerInfo, PeerStatus};
use crate::storage::FileStore;

/// Attempts made to write a mark file before giving up
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a session shares with the rest of the node
pub struct SyncContext {
    pub node: NodeConfig,
    pub sync: SyncConfig,
    pub writer: Arc<BinlogWriter>,
    pub marks: Arc<MarkStore>,
    pub membership: Arc<dyn Membership>,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn FileStore>,
    pub workers: WorkerPool,
    pub shutdown: ShutdownSignal,
}

/// What the outer loop does after a connected run
enum Step {
    /// Re-evaluate the peer status and reconnect if needed
    Resume,
    /// End the session
    Stop,
}

pub struct PeerSyncSession {
    ctx: Arc<SyncContext>,
    peer: PeerInfo,
    pool: Arc<ConnectionPool>,
    syncer: Arc<PeerSyncer>,
    builder: BatchBuilder,
    window: Option<(TimeOfDay, TimeOfDay)>,
    cursor: ReaderCursor,
    /// The cursor was loaded or created for this peer
    cursor_ready: bool,
    /// Cursor as last written to the mark file
    saved: ReaderCursor,
    rows_since_save: u64,
    reader: Option<BinlogReader>,
    last_status: PeerStatus,
    last_keepalive: Instant,
}

impl PeerSyncSession {
    pub fn new(ctx: Arc<SyncContext>, peer: PeerInfo) -> Result<Self> {
        let window = ctx.sync.sync_window()?;
        let pool = Arc::new(ConnectionPool::new(
            peer.clone(),
            ctx.node.id.clone(),
            Arc::clone(&ctx.connector),
            ctx.sync.worker_idle_timeout(),
        ));
        let syncer = Arc::new(PeerSyncer::new(
            ctx.node.group_name.clone(),
            Arc::clone(&pool),
            Arc::clone(&ctx.store),
        ));
        let builder = BatchBuilder::new(ctx.sync.max_workers, ctx.sync.skip_invalid_record);

        Ok(Self {
            ctx,
            peer,
            pool,
            syncer,
            builder,
            window,
            cursor: ReaderCursor::default(),
            cursor_ready: false,
            saved: ReaderCursor::default(),
            rows_since_save: 0,
            reader: None,
            last_status: PeerStatus::Init,
            last_keepalive: Instant::now(),
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Drive the session until the peer leaves, the node shuts down or a
    /// non-recoverable error occurs
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Sync session for peer {} started", self.peer);
        let shutdown = self.ctx.shutdown.clone();
        let mut result = Ok(());

        while !shutdown.is_triggered() {
            let status = self.ctx.membership.peer_status(&self.peer.id).await;
            self.last_status = status;

            if status.is_terminal() {
                break;
            }
            if !status.is_syncable() || !self.in_window() {
                let idle = if status.is_syncable() {
                    self.ctx.sync.heartbeat_interval()
                } else {
                    self.ctx.sync.sync_wait()
                };
                shutdown.sleep(idle).await;
                continue;
            }

            match self.run_connected(status).await {
                Ok(Step::Resume) => {}
                Ok(Step::Stop) | Err(Error::ShuttingDown) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!("Sync session for peer {} failed: {}", self.peer, e);
                    shutdown.trigger();
                    result = Err(e);
                    break;
                }
                Err(e) if e.is_malformed_record() => {
                    tracing::error!(
                        "Sync session for peer {} stopped on a malformed binlog record: {}",
                        self.peer,
                        e
                    );
                    result = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Sync to peer {} interrupted: {}, retrying", self.peer, e);
                    self.pool.close_all().await;
                    shutdown.sleep(backoff(self.ctx.sync.retry_delay())).await;
                }
            }
        }

        let finished = self.finish().await;
        result.and(finished)
    }

    /// Connect, prepare the cursor and replicate while the peer accepts data
    async fn run_connected(&mut self, status: PeerStatus) -> Result<Step> {
        let conn = self.pool.checkout().await?;
        if self.is_self(conn.local_ip()) {
            tracing::error!("Peer {} is this node, not syncing to itself", self.peer);
            return Ok(Step::Stop);
        }
        self.pool.checkin(conn).await;
        self.last_keepalive = Instant::now();

        if !self.cursor_ready {
            self.init_cursor(status).await?;
            self.cursor_ready = true;
        }

        let Some(status) = self.activate(status).await? else {
            return Ok(Step::Resume);
        };

        let position = self.cursor.position;
        match self.reader.as_mut() {
            Some(reader) => reader.rewind_to(position)?,
            None => {
                self.reader = Some(BinlogReader::open(
                    Arc::clone(&self.ctx.writer),
                    &self.peer.id,
                    position,
                )?)
            }
        }

        tracing::info!("Syncing to peer {} ({}) from {}", self.peer, status, position);
        self.sync_loop().await
    }

    fn is_self(&self, local_ip: Option<IpAddr>) -> bool {
        let peer_ip = self.peer.ip_addr.parse::<IpAddr>().ok();
        peer_ip.is_some() && peer_ip == local_ip && self.peer.port == self.ctx.node.port
    }

    fn in_window(&self) -> bool {
        let Some((start, end)) = self.window else {
            return true;
        };
        let now = chrono::Local::now();
        let minutes = now.hour() * 60 + now.minute();
        if start.minutes() <= end.minutes() {
            (start.minutes()..=end.minutes()).contains(&minutes)
        } else {
            minutes >= start.minutes() || minutes <= end.minutes()
        }
    }

    /// Load the checkpoint, or build a new one from the sync-init handshake
    async fn init_cursor(&mut self, status: PeerStatus) -> Result<()> {
        // A peer waiting for its first sync starts over
        let existing = if matches!(status, PeerStatus::Init | PeerStatus::WaitSync) {
            None
        } else {
            self.ctx.marks.load(&self.peer)?
        };

        let plan = match existing {
            Some(cursor) if status == PeerStatus::Syncing => {
                let plan = self.ctx.membership.sync_init_handshake(&self.peer).await?;
                if plan.replay_old && !cursor.replay_old {
                    tracing::info!("Peer {} now needs history, restarting its checkpoint", self.peer);
                    plan
                } else {
                    return self.resume_from(cursor);
                }
            }
            Some(cursor) => return self.resume_from(cursor),
            None => self.ctx.membership.sync_init_handshake(&self.peer).await?,
        };

        let mut cursor = ReaderCursor::fresh(plan);

        if !plan.replay_old && plan.until_timestamp > 0 {
            let mut reader = BinlogReader::open(Arc::clone(&self.ctx.writer), &self.peer.id, cursor.position)?;
            let skipped = reader.skip_to(plan.until_timestamp, self.ctx.sync.skip_invalid_record)?;
            cursor.position = reader.position();
            cursor.scan_row_count = skipped;
            self.reader = Some(reader);
        }

        self.cursor = cursor;
        self.persist().await
    }

    fn resume_from(&mut self, cursor: ReaderCursor) -> Result<()> {
        tracing::info!("Resuming sync to peer {} from {}", self.peer, cursor.position);
        self.saved = cursor.clone();
        self.cursor = cursor;
        Ok(())
    }

    /// Bring the peer into a status that accepts data.
    ///
    /// Returns `None` when the outer loop should wait instead.
    async fn activate(&mut self, status: PeerStatus) -> Result<Option<PeerStatus>> {
        if !self.cursor.replay_old {
            if status == PeerStatus::Active {
                return Ok(Some(status));
            }
            // Another node owns this peer's catch-up
            self.ctx.shutdown.sleep(self.ctx.sync.sync_wait()).await;
            return Ok(None);
        }

        match status {
            PeerStatus::WaitSync => {
                self.report(PeerStatus::Syncing).await?;
                Ok(Some(PeerStatus::Syncing))
            }
            PeerStatus::Syncing if self.cursor.replay_done => {
                self.report(PeerStatus::Offline).await?;
                Ok(None)
            }
            status => Ok(Some(status)),
        }
    }

    async fn report(&mut self, status: PeerStatus) -> Result<()> {
        tracing::info!("Reporting peer {} as {}", self.peer, status);
        self.ctx.membership.report_status(&self.peer.id, status).await?;
        self.last_status = status;
        Ok(())
    }

    async fn sync_loop(&mut self) -> Result<Step> {
        let shutdown = self.ctx.shutdown.clone();
        let syncer: Arc<dyn RecordSyncer> = Arc::clone(&self.syncer) as Arc<dyn RecordSyncer>;

        loop {
            if shutdown.is_triggered() {
                return Ok(Step::Stop);
            }
            let status = self.ctx.membership.peer_status(&self.peer.id).await;
            self.last_status = status;
            if !status.accepts_data() || !self.in_window() {
                return Ok(Step::Resume);
            }

            let batch = {
                let Some(reader) = self.reader.as_mut() else {
                    return Err(Error::Binlog(format!("no binlog reader for peer {}", self.peer)));
                };
                self.builder.build(reader, &self.cursor)?
            };

            if batch.is_empty() {
                self.cursor.position = batch.end;
                self.cursor.scan_row_count += batch.total_rows();
                if batch.rotated {
                    tracing::debug!("Peer {} reader rotated to {}", self.peer, batch.end);
                    self.persist().await?;
                }
                if batch.reached_end && self.on_end_of_log(status).await? {
                    return Ok(Step::Stop);
                }
                continue;
            }

            let result = self.ctx.workers.execute_batch(&batch, Arc::clone(&syncer), &shutdown).await;
            self.cursor.position = result.resume_at;
            self.cursor.scan_row_count += result.scanned_rows;
            self.cursor.sync_row_count += result.synced_rows;
            self.rows_since_save += result.synced_rows + result.skipped_rows;

            if let Some(e) = result.error {
                if let Some(reader) = self.reader.as_mut() {
                    reader.rewind_to(result.resume_at)?;
                }
                if self.cursor != self.saved {
                    self.persist().await?;
                }
                return Err(e);
            }

            if batch.rotated || self.rows_since_save >= self.ctx.sync.write_mark_file_freq {
                self.persist().await?;
            }

            let interval = self.ctx.sync.sync_interval();
            if !interval.is_zero() && shutdown.sleep(interval).await {
                return Ok(Step::Stop);
            }
        }
    }

    /// Nothing left to send: close out history replay, checkpoint and idle.
    ///
    /// Returns true when shutdown interrupted the idle wait.
    async fn on_end_of_log(&mut self, status: PeerStatus) -> Result<bool> {
        if self.cursor.replay_old && !self.cursor.replay_done {
            self.cursor.replay_done = true;
            self.persist().await?;
            tracing::info!("Peer {} caught up with history at {}", self.peer, self.cursor.position);
            if status == PeerStatus::Syncing {
                self.report(PeerStatus::Offline).await?;
            }
        }

        if self.cursor != self.saved {
            self.persist().await?;
        }

        if self.last_keepalive.elapsed() >= self.ctx.sync.heartbeat_interval() {
            let mut conn = self.pool.checkout().await?;
            conn.active_test().await?;
            self.pool.checkin(conn).await;
            self.pool.cleanup_stale().await;
            self.last_keepalive = Instant::now();
        }

        Ok(self.ctx.shutdown.sleep(self.ctx.sync.sync_wait()).await)
    }

    /// Write the cursor to the mark file, retrying a few times
    async fn persist(&mut self) -> Result<()> {
        let cursor = self.cursor.clone();
        let mut attempt = 1;
        loop {
            match self.ctx.marks.save(&self.peer, &cursor) {
                Ok(()) => break,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    tracing::warn!("Writing mark file of peer {} failed (attempt {}): {}", self.peer, attempt, e);
                    attempt += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.saved = cursor;
        self.rows_since_save = 0;
        Ok(())
    }

    /// Final checkpoint and, for a peer that left, the membership bookkeeping
    async fn finish(&mut self) -> Result<()> {
        let mut result = Ok(());
        if self.cursor_ready && self.cursor != self.saved {
            result = self.persist().await;
        }
        self.reader = None;
        self.pool.close_all().await;

        if self.last_status.is_terminal() {
            if let Err(e) = self.ctx.membership.request_changelog().await {
                tracing::warn!("Changelog request after peer {} left failed: {}", self.peer, e);
            }
            if self.last_status == PeerStatus::Deleted {
                self.ctx.marks.archive(&self.peer)?;
            }
            if self.last_status != PeerStatus::None {
                self.report(PeerStatus::None).await?;
            }
        }

        tracing::info!(
            "Sync session for peer {} ended at {} ({} scanned, {} synced)",
            self.peer,
            self.cursor.position,
            self.cursor.scan_row_count,
            self.cursor.sync_row_count
        );
        result
    }
}

/// Retry delay with up to 50% jitter so peers do not reconnect in lockstep
fn backoff(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinlogPosition, OpType};
    use crate::config::BinlogConfig;
    use crate::network::TcpConnector;
    use crate::protocol::cmd;
    use crate::state::{ReplayPlan, StaticMembership};
    use crate::storage::LocalFileStore;
    use crate::testing::{FakePeer, Received};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Harness {
        ctx: Arc<SyncContext>,
        membership: Arc<StaticMembership>,
    }

    fn harness(dir: &Path, plan: ReplayPlan) -> Harness {
        harness_with_binlog(dir, plan, BinlogConfig::default())
    }

    fn harness_with_binlog(dir: &Path, plan: ReplayPlan, binlog: BinlogConfig) -> Harness {
        let node = NodeConfig {
            id: "100001".into(),
            group_name: "group1".into(),
            base_path: dir.to_path_buf(),
            store_paths: vec![dir.join("store")],
            port: 23000,
            use_storage_id: true,
        };
        let sync = SyncConfig {
            write_mark_file_freq: 1,
            sync_wait_ms: 10,
            heartbeat_interval_secs: 1,
            connect_timeout_secs: 2,
            network_timeout_secs: 2,
            retry_delay_ms: 20,
            ..Default::default()
        };
        let sync_dir = dir.join("data").join("sync");
        let writer = Arc::new(BinlogWriter::open(sync_dir.clone(), binlog).unwrap());
        let membership = Arc::new(StaticMembership::new(plan));
        let ctx = Arc::new(SyncContext {
            marks: Arc::new(MarkStore::new(sync_dir, true)),
            writer,
            membership: Arc::clone(&membership) as Arc<dyn Membership>,
            connector: Arc::new(TcpConnector::new(sync.connect_timeout(), sync.network_timeout())),
            store: Arc::new(LocalFileStore::new(node.store_paths.clone())),
            workers: WorkerPool::new(sync.max_workers),
            shutdown: ShutdownSignal::new(),
            node,
            sync,
        });
        Harness { ctx, membership }
    }

    /// Same node state as after a process restart: new shutdown signal,
    /// same binlog and mark files
    fn restarted(ctx: &SyncContext) -> Arc<SyncContext> {
        Arc::new(SyncContext {
            node: ctx.node.clone(),
            sync: ctx.sync.clone(),
            writer: Arc::clone(&ctx.writer),
            marks: Arc::clone(&ctx.marks),
            membership: Arc::clone(&ctx.membership),
            connector: Arc::clone(&ctx.connector),
            store: Arc::clone(&ctx.store),
            workers: ctx.workers.clone(),
            shutdown: ShutdownSignal::new(),
        })
    }

    fn add_file(dir: &Path, name: &str, ts: i64, op: OpType, ctx: &SyncContext) {
        let path = dir.join("store/data/00/00").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, name.as_bytes()).unwrap();
        ctx.writer
            .append(ts, op, &format!("M00/00/00/{}", name), None)
            .unwrap();
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_syncs_and_checkpoints() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), ReplayPlan::default());
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            add_file(dir.path(), name, 100 + i as i64, OpType::SourceCreate, &h.ctx);
        }
        h.ctx.writer.flush().unwrap();

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let session = PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap();
        let handle = tokio::spawn(session.run());

        eventually(|| peer.sync_requests().len() == 3).await;
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let mut names: Vec<String> = peer.sync_requests().iter().map(Received::copy_filename).collect();
        names.sort();
        assert_eq!(names, vec!["M00/00/00/a", "M00/00/00/b", "M00/00/00/c"]);

        let cursor = h.ctx.marks.load(&info).unwrap().unwrap();
        assert_eq!(cursor.position, h.ctx.writer.flushed_position().unwrap());
        assert_eq!(cursor.sync_row_count, 3);
        assert_eq!(cursor.scan_row_count, 3);
        assert!(h.membership.reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_replay_reports_caught_up() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            ReplayPlan {
                replay_old: true,
                until_timestamp: 1000,
            },
        );
        add_file(dir.path(), "old", 100, OpType::ReplicaCreate, &h.ctx);
        add_file(dir.path(), "new", 2000, OpType::SourceCreate, &h.ctx);
        add_file(dir.path(), "late", 2001, OpType::ReplicaCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::WaitSync).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());

        for _ in 0..500 {
            if h.membership.peer_status(&info.id).await == PeerStatus::Offline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let reports: Vec<PeerStatus> = h.membership.reports().await.into_iter().map(|(_, s)| s).collect();
        assert_eq!(reports, vec![PeerStatus::Syncing, PeerStatus::Offline]);
        assert_eq!(peer.sync_requests().len(), 2);

        let cursor = h.ctx.marks.load(&info).unwrap().unwrap();
        assert!(cursor.replay_old);
        assert!(cursor.replay_done);
        assert_eq!(cursor.scan_row_count, 3);
        assert_eq!(cursor.sync_row_count, 2);
    }

    #[tokio::test]
    async fn test_new_peer_skips_history() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            ReplayPlan {
                replay_old: false,
                until_timestamp: 150,
            },
        );
        add_file(dir.path(), "a", 100, OpType::SourceCreate, &h.ctx);
        add_file(dir.path(), "b", 200, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());
        eventually(|| peer.sync_requests().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let requests = peer.sync_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].copy_filename(), "M00/00/00/b");

        let cursor = h.ctx.marks.load(&info).unwrap().unwrap();
        assert_eq!(cursor.scan_row_count, 2);
        assert_eq!(cursor.sync_row_count, 1);
    }

    #[tokio::test]
    async fn test_failed_record_is_resent() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), ReplayPlan::default());
        add_file(dir.path(), "a", 100, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let peer = {
            let failures = Arc::clone(&failures);
            FakePeer::start(Arc::new(move |r: &Received| {
                if r.cmd == cmd::SYNC_CREATE_FILE && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    (5, Vec::new())
                } else {
                    (0, Vec::new())
                }
            }))
            .await
        };
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());
        eventually(|| peer.sync_requests().len() == 2).await;
        eventually(|| {
            h.ctx
                .marks
                .load(&info)
                .ok()
                .flatten()
                .map_or(false, |c| c.sync_row_count == 1)
        })
        .await;
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let requests = peer.sync_requests();
        assert_eq!(requests[0].copy_filename(), requests[1].copy_filename());
        let cursor = h.ctx.marks.load(&info).unwrap().unwrap();
        assert_eq!(cursor.position, h.ctx.writer.flushed_position().unwrap());
    }

    #[tokio::test]
    async fn test_deleted_peer_archives_mark() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), ReplayPlan::default());
        add_file(dir.path(), "a", 100, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());
        eventually(|| h.ctx.marks.path_for(&info).exists() && peer.sync_requests().len() == 1).await;

        h.membership.set_status(&info.id, PeerStatus::Deleted).await;
        handle.await.unwrap().unwrap();

        assert_eq!(h.membership.changelog_requests(), 1);
        assert_eq!(h.membership.reports().await, vec![(info.id.clone(), PeerStatus::None)]);
        assert!(!h.ctx.marks.path_for(&info).exists());
        let archived = std::fs::read_dir(dir.path().join("data/sync"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("100002.mark."));
        assert!(archived);
        assert!(!h.ctx.shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_refuses_to_sync_to_itself() {
        let dir = tempdir().unwrap();
        let peer = FakePeer::start_ok().await;
        let mut h = harness(dir.path(), ReplayPlan::default());
        Arc::get_mut(&mut h.ctx).unwrap().node.port = peer.addr.port();

        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let session = PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap()
            .unwrap();
        assert!(peer.sync_requests().is_empty());
        assert!(!h.ctx.marks.path_for(&info).exists());
    }

    #[tokio::test]
    async fn test_restart_resumes_from_mark() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), ReplayPlan::default());
        add_file(dir.path(), "a", 100, OpType::SourceCreate, &h.ctx);
        add_file(dir.path(), "b", 101, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());
        eventually(|| peer.sync_requests().len() == 2).await;
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(h.ctx.marks.load(&info).unwrap().unwrap().sync_row_count, 2);

        add_file(dir.path(), "c", 102, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();

        let ctx = restarted(&h.ctx);
        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&ctx), info.clone()).unwrap().run());
        eventually(|| peer.sync_requests().len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let names: Vec<String> = peer.sync_requests().iter().map(Received::copy_filename).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[2], "M00/00/00/c");
        let mut first_run = names[..2].to_vec();
        first_run.sort();
        assert_eq!(first_run, vec!["M00/00/00/a", "M00/00/00/b"]);

        let cursor = ctx.marks.load(&info).unwrap().unwrap();
        assert_eq!(cursor.position, ctx.writer.flushed_position().unwrap());
        assert_eq!(cursor.sync_row_count, 3);
        assert_eq!(cursor.scan_row_count, 3);
    }

    #[tokio::test]
    async fn test_rotation_is_checkpointed() {
        let dir = tempdir().unwrap();
        let binlog = BinlogConfig {
            segment_max_bytes: 20,
            ..BinlogConfig::default()
        };
        let h = harness_with_binlog(dir.path(), ReplayPlan::default(), binlog);

        // Every flushed line is longer than a segment
        add_file(dir.path(), "rotating-1", 100, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();
        assert_eq!(h.ctx.writer.current_index().unwrap(), 1);

        let peer = FakePeer::start_ok().await;
        let info = peer.peer_info("100002");
        h.membership.set_status(&info.id, PeerStatus::Active).await;

        let handle = tokio::spawn(PeerSyncSession::new(Arc::clone(&h.ctx), info.clone()).unwrap().run());
        let marks = Arc::clone(&h.ctx.marks);
        eventually(|| {
            marks
                .load(&info)
                .ok()
                .flatten()
                .map_or(false, |c| c.position == BinlogPosition::new(1, 0))
        })
        .await;

        // The writer rotates again while the session idles at the end of segment 1
        add_file(dir.path(), "rotating-2", 101, OpType::SourceCreate, &h.ctx);
        h.ctx.writer.flush().unwrap();
        assert_eq!(h.ctx.writer.current_index().unwrap(), 2);

        eventually(|| {
            marks
                .load(&info)
                .ok()
                .flatten()
                .map_or(false, |c| c.position.index == 2)
        })
        .await;
        h.ctx.shutdown.trigger();
        handle.await.unwrap().unwrap();

        let cursor = marks.load(&info).unwrap().unwrap();
        assert_eq!(cursor.position, BinlogPosition::new(2, 0));
        assert_eq!(cursor.sync_row_count, 2);
        let names: Vec<String> = peer.sync_requests().iter().map(Received::copy_filename).collect();
        assert_eq!(names, vec!["M00/00/00/rotating-1", "M00/00/00/rotating-2"]);
    }

    #[test]
    fn test_backoff_jitter() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = backoff(base);
            assert!(delay >= base && delay <= Duration::from_millis(150));
        }
        assert_eq!(backoff(Duration::ZERO), Duration::ZERO);
    }
}
