//! Network Module
//!
//! Connections to peer storage nodes.

mod client;

pub use client::{ConnectionPool, TcpConnector};

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{read_response, Response, SyncRequest};
use crate::state::PeerInfo;

/// Opens connections to peers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &PeerInfo) -> Result<PeerConnection>;
}

/// A live connection to one peer, with per-operation timeouts
pub struct PeerConnection {
    stream: TcpStream,
    address: String,
    network_timeout: Duration,
    last_used: Instant,
}

impl PeerConnection {
    pub fn new(stream: TcpStream, address: String, network_timeout: Duration) -> Self {
        Self {
            stream,
            address,
            network_timeout,
            last_used: Instant::now(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Local address this connection was made from
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.stream.local_addr().ok().map(|addr| addr.ip())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Send raw bytes
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match timeout(self.network_timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Network(format!("send to {} failed: {}", self.address, e))),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Receive one response
    pub async fn recv_response(&mut self) -> Result<Response> {
        match timeout(self.network_timeout, read_response(&mut self.stream)).await {
            Ok(Ok(response)) => {
                self.last_used = Instant::now();
                Ok(response)
            }
            Ok(Err(Error::Io(e))) => Err(Error::Network(format!(
                "receive from {} failed: {}",
                self.address, e
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Send a request that carries no content and expect status 0
    pub async fn call(&mut self, request: &SyncRequest, group_name: &str) -> Result<Response> {
        self.send(&request.encode_head(group_name)).await?;
        let response = self.recv_response().await?;
        if response.status != 0 {
            return Err(Error::PeerStatus {
                peer: self.address.clone(),
                cmd: request.cmd(),
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Keepalive probe
    pub async fn active_test(&mut self) -> Result<()> {
        self.call(&SyncRequest::ActiveTest, "").await.map(|_| ())
    }

    /// Tell the peer which storage node is talking to it
    pub async fn report_server_id(&mut self, storage_id: &str) -> Result<()> {
        let request = SyncRequest::ReportServerId {
            storage_id: storage_id.to_string(),
        };
        self.call(&request, "").await.map(|_| ())
    }
}
