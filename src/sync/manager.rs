//! Sync Manager
//!
//! Owns the per-peer sync sessions of this node.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::mark::MarkStore;
use super::pool::WorkerPool;
use super::session::{PeerSyncSession, SyncContext};
use super::ShutdownSignal;
use crate::binlog::BinlogWriter;
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::network::Connector;
use crate::state::{Membership, PeerInfo};
use crate::storage::FileStore;

/// A running session task
struct SessionHandle {
    peer: PeerInfo,
    handle: JoinHandle<Result<()>>,
}

/// Starts, tracks and stops sync sessions, one per peer
pub struct SyncManager {
    ctx: Arc<SyncContext>,
    /// Running sessions by peer id
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Peers the worker pool has slots for
    provisioned_peers: Mutex<usize>,
    flush_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SyncManager {
    pub fn new(
        config: &WolfSyncConfig,
        writer: Arc<BinlogWriter>,
        membership: Arc<dyn Membership>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn FileStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let ctx = SyncContext {
            node: config.node.clone(),
            sync: config.sync.clone(),
            writer,
            marks: Arc::new(MarkStore::new(config.sync_dir(), config.node.use_storage_id)),
            membership,
            connector,
            store,
            workers: WorkerPool::new(config.sync.max_workers),
            shutdown,
        };
        Self {
            ctx: Arc::new(ctx),
            sessions: Mutex::new(HashMap::new()),
            provisioned_peers: Mutex::new(1),
            flush_task: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Run the binlog writer's periodic flush until shutdown
    pub async fn start_flush_loop(&self) {
        let mut task = self.flush_task.lock().await;
        if task.is_none() {
            let writer = Arc::clone(&self.ctx.writer);
            *task = Some(tokio::spawn(writer.run_flush_loop(self.ctx.shutdown.subscribe())));
        }
    }

    /// Whether `peer` is this node
    fn is_self(&self, peer: &PeerInfo) -> bool {
        if peer.id == self.ctx.node.id {
            return true;
        }
        peer.port == self.ctx.node.port && peer.ip_addr.parse::<IpAddr>().map_or(false, is_local_address)
    }

    /// Start syncing to `peer`. Returns false when the peer is this node or
    /// already has a session.
    pub async fn start_session(&self, peer: PeerInfo) -> Result<bool> {
        if self.ctx.shutdown.is_triggered() {
            return Err(Error::ShuttingDown);
        }
        if self.is_self(&peer) {
            tracing::warn!("Not starting a sync session to {}: it is this node", peer);
            return Ok(false);
        }

        self.reap_finished().await;
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&peer.id) {
            tracing::debug!("Sync session to {} already running", peer);
            return Ok(false);
        }

        let session = PeerSyncSession::new(Arc::clone(&self.ctx), peer.clone())?;

        let mut provisioned = self.provisioned_peers.lock().await;
        if sessions.len() + 1 > *provisioned {
            self.ctx.workers.add_slots(self.ctx.sync.max_workers);
            *provisioned += 1;
        }

        let handle = tokio::spawn(session.run());
        tracing::info!("Started sync session to {} ({} running)", peer, sessions.len() + 1);
        sessions.insert(peer.id.clone(), SessionHandle { peer, handle });
        Ok(true)
    }

    /// Wait for the session of a peer that moved to end, then carry its
    /// checkpoint over to the new address.
    ///
    /// Start the new session once the tracker lists the peer again.
    pub async fn handle_ip_changed(&self, old: &PeerInfo, new: &PeerInfo) -> Result<bool> {
        let running = self.sessions.lock().await.remove(&old.id);
        if let Some(session) = running {
            join_session(session).await?;
        }
        self.ctx.marks.rename_for_ip_change(old, new)
    }

    /// Ids of peers with a live session
    pub async fn running_peers(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut peers: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| !session.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Collect sessions that ended on their own
    pub async fn reap_finished(&self) -> Vec<(PeerInfo, Result<()>)> {
        let finished: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut results = Vec::with_capacity(finished.len());
        for session in finished {
            let peer = session.peer.clone();
            results.push((peer, join_session(session).await));
        }
        results
    }

    /// Stop every session and the flush loop.
    ///
    /// Returns the first fatal error any of them ended with.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown.trigger();

        let sessions: Vec<SessionHandle> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let mut first_fatal = None;
        for session in sessions {
            if let Err(e) = join_session(session).await {
                if e.is_fatal() && first_fatal.is_none() {
                    first_fatal = Some(e);
                }
            }
        }

        if let Some(task) = self.flush_task.lock().await.take() {
            match task.await {
                Ok(Err(e)) if first_fatal.is_none() => first_fatal = Some(e),
                Ok(_) => {}
                Err(e) => tracing::error!("Binlog flush task panicked: {}", e),
            }
        }

        tracing::info!("Sync manager stopped");
        first_fatal.map_or(Ok(()), Err)
    }
}

async fn join_session(session: SessionHandle) -> Result<()> {
    match session.handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::warn!("Sync session to {} ended with error: {}", session.peer, e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("Sync session to {} panicked: {}", session.peer, e);
            Ok(())
        }
    }
}

/// An address is local when a socket can be bound to it
fn is_local_address(ip: IpAddr) -> bool {
    ip.is_loopback() || UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TcpConnector;
    use crate::state::{PeerStatus, ReplayPlan, StaticMembership};
    use crate::storage::LocalFileStore;
    use crate::testing::FakePeer;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &Path, use_storage_id: bool) -> WolfSyncConfig {
        let toml = format!(
            r#"
[node]
id = "100001"
group_name = "group1"
base_path = "{base}"
store_paths = ["{base}/store"]
use_storage_id = {use_storage_id}

[sync]
sync_wait_ms = 10
retry_delay_ms = 20
connect_timeout_secs = 2
network_timeout_secs = 2
"#,
            base = dir.display(),
            use_storage_id = use_storage_id
        );
        WolfSyncConfig::from_str(&toml).unwrap()
    }

    fn manager(dir: &Path, use_storage_id: bool) -> (SyncManager, Arc<StaticMembership>) {
        let config = config(dir, use_storage_id);
        let writer = Arc::new(BinlogWriter::open(config.sync_dir(), config.binlog.clone()).unwrap());
        let membership = Arc::new(StaticMembership::new(ReplayPlan::default()));
        let manager = SyncManager::new(
            &config,
            writer,
            Arc::clone(&membership) as Arc<dyn Membership>,
            Arc::new(TcpConnector::new(Duration::from_secs(2), Duration::from_secs(2))),
            Arc::new(LocalFileStore::new(config.node.store_paths.clone())),
            ShutdownSignal::new(),
        );
        (manager, membership)
    }

    #[tokio::test]
    async fn test_refuses_self_and_duplicates() {
        let dir = tempdir().unwrap();
        let (manager, membership) = manager(dir.path(), true);

        assert!(!manager.start_session(PeerInfo::new("100001", "10.0.0.9", 23000)).await.unwrap());
        assert!(!manager.start_session(PeerInfo::new("100009", "127.0.0.1", 23000)).await.unwrap());

        let peer = PeerInfo::new("100002", "10.255.0.2", 23000);
        membership.set_status(&peer.id, PeerStatus::Offline).await;
        assert!(manager.start_session(peer.clone()).await.unwrap());
        assert!(!manager.start_session(peer).await.unwrap());
        assert_eq!(manager.running_peers().await, vec!["100002".to_string()]);

        manager.shutdown().await.unwrap();
        assert!(manager.running_peers().await.is_empty());
        assert!(matches!(
            manager.start_session(PeerInfo::new("100003", "10.255.0.3", 23000)).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_worker_slots_grow_with_peers() {
        let dir = tempdir().unwrap();
        let (manager, membership) = manager(dir.path(), true);
        let max_workers = manager.context().sync.max_workers;

        for id in ["100002", "100003"] {
            membership.set_status(id, PeerStatus::Offline).await;
            assert!(manager.start_session(PeerInfo::new(id, "10.255.0.2", 23000)).await.unwrap());
        }
        assert_eq!(manager.context().workers.available_slots(), 2 * max_workers);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_sessions_are_reaped() {
        let dir = tempdir().unwrap();
        let (manager, _membership) = manager(dir.path(), true);

        // Unknown peers have no status and end right away
        let peer = PeerInfo::new("100002", "10.255.0.2", 23000);
        assert!(manager.start_session(peer.clone()).await.unwrap());
        for _ in 0..200 {
            if manager.running_peers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reaped = manager.reap_finished().await;
        assert_eq!(reaped.len(), 1);
        assert!(reaped[0].1.is_ok());
        assert!(manager.start_session(peer).await.unwrap());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ip_change_moves_mark() {
        let dir = tempdir().unwrap();
        let (manager, membership) = manager(dir.path(), false);
        manager.start_flush_loop().await;

        let peer = FakePeer::start_ok().await;
        let old = peer.peer_info("100002");
        membership.set_status(&old.id, PeerStatus::Active).await;
        assert!(manager.start_session(old.clone()).await.unwrap());

        let marks = Arc::clone(&manager.context().marks);
        for _ in 0..500 {
            if marks.path_for(&old).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(marks.path_for(&old).exists());

        membership.set_status(&old.id, PeerStatus::IpChanged).await;
        let new = PeerInfo::new("100002", "10.255.0.7", old.port);
        assert!(manager.handle_ip_changed(&old, &new).await.unwrap());

        assert!(!marks.path_for(&old).exists());
        assert!(marks.path_for(&new).exists());
        assert!(manager.running_peers().await.is_empty());
        assert_eq!(membership.changelog_requests(), 1);
        manager.shutdown().await.unwrap();
    }
}
