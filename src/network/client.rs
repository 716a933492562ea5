//! Network Client
//!
//! TCP connector and the per-peer connection pool used by sync workers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{Connector, PeerConnection};
use crate::error::{Error, Result};
use crate::state::PeerInfo;

/// Plain TCP connector
pub struct TcpConnector {
    connect_timeout: Duration,
    network_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, network_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            network_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &PeerInfo) -> Result<PeerConnection> {
        let address = peer.address();
        let result = timeout(self.connect_timeout, TcpStream::connect(&address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(PeerConnection::new(stream, address, self.network_timeout))
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address)),
        }
    }
}

/// Idle connections to one peer, shared by the session and its workers
pub struct ConnectionPool {
    peer: PeerInfo,
    /// This node's storage id, reported on every new connection
    local_id: String,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<PeerConnection>>,
    max_idle: Duration,
}

impl ConnectionPool {
    pub fn new(peer: PeerInfo, local_id: String, connector: Arc<dyn Connector>, max_idle: Duration) -> Self {
        Self {
            peer,
            local_id,
            connector,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Take an idle connection or open a new one
    pub async fn checkout(&self) -> Result<PeerConnection> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(conn) = idle.pop() {
                if conn.idle_for() <= self.max_idle {
                    return Ok(conn);
                }
                tracing::debug!("Dropping stale connection to {}", self.peer);
            }
        }

        let mut conn = self.connector.connect(&self.peer).await?;
        conn.report_server_id(&self.local_id).await?;
        tracing::debug!("Connected to peer {}", self.peer);
        Ok(conn)
    }

    /// Return a healthy connection
    pub async fn checkin(&self, conn: PeerConnection) {
        self.idle.lock().await.push(conn);
    }

    /// Close connections idle for longer than the limit
    pub async fn cleanup_stale(&self) -> usize {
        let mut idle = self.idle.lock().await;
        let before = idle.len();
        idle.retain(|conn| conn.idle_for() <= self.max_idle);
        before - idle.len()
    }

    /// Close all idle connections
    pub async fn close_all(&self) {
        self.idle.lock().await.clear();
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}
