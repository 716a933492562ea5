//! Test support: a peer storage node speaking the sync protocol over loopback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::protocol::{cmd, Header, GROUP_NAME_MAX_LEN, HEADER_SIZE};
use crate::state::PeerInfo;

/// One request as seen by the fake peer
#[derive(Debug, Clone)]
pub struct Received {
    pub cmd: u8,
    /// Status byte of the request header
    pub status: u8,
    pub body: Vec<u8>,
}

impl Received {
    /// Text after the fixed fields (`fixed` bytes), i.e. filenames plus content
    pub fn tail(&self, fixed: usize) -> String {
        String::from_utf8_lossy(&self.body[fixed.min(self.body.len())..]).into_owned()
    }

    /// Filename of a create/update request
    pub fn copy_filename(&self) -> String {
        let len = u64::from_be_bytes(self.body[0..8].try_into().unwrap()) as usize;
        let start = 8 + 8 + 4 + GROUP_NAME_MAX_LEN;
        String::from_utf8_lossy(&self.body[start..start + len]).into_owned()
    }

    /// Filename of a delete request
    pub fn delete_filename(&self) -> String {
        self.tail(4 + GROUP_NAME_MAX_LEN)
    }
}

/// Decides the status and body of the answer to a request
pub type Responder = Arc<dyn Fn(&Received) -> (u8, Vec<u8>) + Send + Sync>;

pub struct FakePeer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Received>>>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakePeer {
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, Arc::clone(&requests), Arc::clone(&responder)));
                }
            })
        };

        Self {
            addr,
            requests,
            connections,
            handle,
        }
    }

    /// Peer answering every request with status 0
    pub async fn start_ok() -> Self {
        Self::start(Arc::new(|_| (0, Vec::new()))).await
    }

    pub fn peer_info(&self, id: &str) -> PeerInfo {
        PeerInfo::new(id, self.addr.ip().to_string(), self.addr.port())
    }

    pub fn requests(&self) -> Vec<Received> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests other than handshakes and keepalives
    pub fn sync_requests(&self) -> Vec<Received> {
        self.requests()
            .into_iter()
            .filter(|r| r.cmd != cmd::REPORT_SERVER_ID && r.cmd != cmd::ACTIVE_TEST)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, requests: Arc<Mutex<Vec<Received>>>, responder: Responder) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let header = Header::from_bytes(&header);
        let mut body = vec![0u8; header.body_len as usize];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let received = Received {
            cmd: header.cmd,
            status: header.status,
            body,
        };
        let (status, reply) = responder(&received);
        requests.lock().unwrap().push(received);

        let mut response = Header {
            body_len: reply.len() as u64,
            cmd: cmd::RESP,
            status,
        }
        .to_bytes()
        .to_vec();
        response.extend_from_slice(&reply);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}
