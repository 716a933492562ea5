//! Group Membership
//!
//! Peer identities and statuses as seen by this node, and the interface to
//! the tracker that owns them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::Result;

/// Status of a peer storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Just registered, nothing known yet
    Init,
    /// Waiting for its initial sync source
    WaitSync,
    /// Catching up on history
    Syncing,
    /// Peer moved to a new address
    IpChanged,
    /// Peer was removed from the group
    Deleted,
    /// Peer is not reachable by the tracker
    Offline,
    /// Peer is reachable but not serving yet
    Online,
    /// Peer is up to date and serving
    Active,
    /// Peer is restoring its own data
    Recovery,
    /// Session is finished
    None,
}

impl PeerStatus {
    /// Status byte used by the tracker protocol
    pub fn code(self) -> u8 {
        match self {
            PeerStatus::Init => 0,
            PeerStatus::WaitSync => 1,
            PeerStatus::Syncing => 2,
            PeerStatus::IpChanged => 3,
            PeerStatus::Deleted => 4,
            PeerStatus::Offline => 5,
            PeerStatus::Online => 6,
            PeerStatus::Active => 7,
            PeerStatus::Recovery => 9,
            PeerStatus::None => 99,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PeerStatus::Init,
            1 => PeerStatus::WaitSync,
            2 => PeerStatus::Syncing,
            3 => PeerStatus::IpChanged,
            4 => PeerStatus::Deleted,
            5 => PeerStatus::Offline,
            6 => PeerStatus::Online,
            7 => PeerStatus::Active,
            9 => PeerStatus::Recovery,
            99 => PeerStatus::None,
            _ => return None,
        })
    }

    /// The session for this peer must end
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerStatus::IpChanged | PeerStatus::Deleted | PeerStatus::None)
    }

    /// A session may connect and prepare its reader
    pub fn is_syncable(self) -> bool {
        matches!(self, PeerStatus::Active | PeerStatus::WaitSync | PeerStatus::Syncing)
    }

    /// Records may be pushed to the peer
    pub fn accepts_data(self) -> bool {
        matches!(self, PeerStatus::Active | PeerStatus::Syncing)
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Init => write!(f, "INIT"),
            PeerStatus::WaitSync => write!(f, "WAIT_SYNC"),
            PeerStatus::Syncing => write!(f, "SYNCING"),
            PeerStatus::IpChanged => write!(f, "IP_CHANGED"),
            PeerStatus::Deleted => write!(f, "DELETED"),
            PeerStatus::Offline => write!(f, "OFFLINE"),
            PeerStatus::Online => write!(f, "ONLINE"),
            PeerStatus::Active => write!(f, "ACTIVE"),
            PeerStatus::Recovery => write!(f, "RECOVERY"),
            PeerStatus::None => write!(f, "NONE"),
        }
    }
}

/// Identity and address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Storage id
    pub id: String,
    pub ip_addr: String,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, ip_addr: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip_addr: ip_addr.into(),
            port,
        }
    }

    /// Socket address (host:port)
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_addr, self.port)
    }

    /// Key used to name this peer's mark file
    pub fn mark_key(&self, use_storage_id: bool) -> String {
        if use_storage_id {
            self.id.clone()
        } else {
            self.ip_port_key()
        }
    }

    /// Legacy `ip_port` mark key
    pub fn ip_port_key(&self) -> String {
        format!("{}_{}", self.ip_addr, self.port)
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.ip_addr, self.port)
    }
}

/// Answer of the sync-init handshake for a new peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPlan {
    /// The peer must receive the history that predates it
    pub replay_old: bool,
    /// History boundary: replay covers records up to this timestamp, live
    /// tailing starts at it
    pub until_timestamp: i64,
}

/// Tracker-facing view of the group
#[async_trait]
pub trait Membership: Send + Sync {
    /// Current status of a peer, `PeerStatus::None` when unknown
    async fn peer_status(&self, peer_id: &str) -> PeerStatus;

    /// Record a status transition locally and report it to the tracker
    async fn report_status(&self, peer_id: &str, status: PeerStatus) -> Result<()>;

    /// Ask the group leader whether `peer` needs historical replay
    async fn sync_init_handshake(&self, peer: &PeerInfo) -> Result<ReplayPlan>;

    /// Ask the tracker for a fresh changelog after a peer left or moved
    async fn request_changelog(&self) -> Result<()>;
}

/// In-process membership table.
///
/// Embedding applications feed tracker updates into it with `set_status`;
/// sessions read and report through the `Membership` trait.
pub struct StaticMembership {
    statuses: RwLock<HashMap<String, PeerStatus>>,
    plans: RwLock<HashMap<String, ReplayPlan>>,
    default_plan: ReplayPlan,
    reports: RwLock<Vec<(String, PeerStatus)>>,
    changelog_requests: AtomicU64,
}

impl StaticMembership {
    pub fn new(default_plan: ReplayPlan) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            default_plan,
            reports: RwLock::new(Vec::new()),
            changelog_requests: AtomicU64::new(0),
        }
    }

    /// Set a peer's status as announced by the tracker
    pub async fn set_status(&self, peer_id: &str, status: PeerStatus) {
        let previous = self.statuses.write().await.insert(peer_id.to_string(), status);
        if previous != Some(status) {
            tracing::debug!("Peer {} status {:?} -> {}", peer_id, previous, status);
        }
    }

    /// Override the handshake answer for one peer
    pub async fn set_replay_plan(&self, peer_id: &str, plan: ReplayPlan) {
        self.plans.write().await.insert(peer_id.to_string(), plan);
    }

    pub async fn remove_peer(&self, peer_id: &str) -> Option<PeerStatus> {
        self.statuses.write().await.remove(peer_id)
    }

    /// Status reports made by sessions, oldest first
    pub async fn reports(&self) -> Vec<(String, PeerStatus)> {
        self.reports.read().await.clone()
    }

    pub fn changelog_requests(&self) -> u64 {
        self.changelog_requests.load(Ordering::Relaxed)
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new(ReplayPlan::default())
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn peer_status(&self, peer_id: &str) -> PeerStatus {
        self.statuses
            .read()
            .await
            .get(peer_id)
            .copied()
            .unwrap_or(PeerStatus::None)
    }

    async fn report_status(&self, peer_id: &str, status: PeerStatus) -> Result<()> {
        self.set_status(peer_id, status).await;
        self.reports.write().await.push((peer_id.to_string(), status));
        Ok(())
    }

    async fn sync_init_handshake(&self, peer: &PeerInfo) -> Result<ReplayPlan> {
        let plan = self
            .plans
            .read()
            .await
            .get(&peer.id)
            .copied()
            .unwrap_or(self.default_plan);
        tracing::info!(
            "Sync init for peer {}: replay_old={}, until_timestamp={}",
            peer,
            plan.replay_old,
            plan.until_timestamp
        );
        Ok(plan)
    }

    async fn request_changelog(&self) -> Result<()> {
        self.changelog_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
