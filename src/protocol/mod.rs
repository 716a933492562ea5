//! Peer Protocol
//!
//! Storage-to-storage sync sub-protocol. Every request and response starts
//! with a 10 byte header: body length (u64 BE), command, status. All integers
//! are big-endian.

mod ops;

pub use ops::{FileInfo, StatusVerdict, SyncRequest};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 10;

/// Width of the group name field
pub const GROUP_NAME_MAX_LEN: usize = 16;

/// Width of the storage id field
pub const STORAGE_ID_MAX_LEN: usize = 16;

/// Upper bound for a response body
pub const MAX_RESPONSE_BODY: u64 = 64 * 1024;

/// Command codes
pub mod cmd {
    pub const REPORT_SERVER_ID: u8 = 9;
    pub const SYNC_CREATE_FILE: u8 = 16;
    pub const SYNC_DELETE_FILE: u8 = 17;
    pub const SYNC_UPDATE_FILE: u8 = 18;
    pub const SYNC_CREATE_LINK: u8 = 19;
    pub const QUERY_FILE_INFO: u8 = 22;
    pub const SYNC_APPEND_FILE: u8 = 25;
    pub const SYNC_MODIFY_FILE: u8 = 35;
    pub const SYNC_TRUNCATE_FILE: u8 = 37;
    pub const SYNC_RENAME_FILE: u8 = 40;
    pub const RESP: u8 = 100;
    pub const ACTIVE_TEST: u8 = 111;
}

/// Response status codes with a meaning of their own
pub mod status {
    pub const OK: u8 = 0;
    pub const ENOENT: u8 = 2;
    pub const EEXIST: u8 = 17;
}

/// Fixed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of everything after the header
    pub body_len: u64,
    pub cmd: u8,
    pub status: u8,
}

impl Header {
    pub fn new(cmd: u8, body_len: u64) -> Self {
        Self {
            body_len,
            cmd,
            status: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.body_len.to_be_bytes());
        bytes[8] = self.cmd;
        bytes[9] = self.status;
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[0..8]);
        Self {
            body_len: u64::from_be_bytes(len),
            cmd: bytes[8],
            status: bytes[9],
        }
    }
}

/// Builder for the fixed part of a request body
pub struct BodyWriter {
    buf: BytesMut,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
        }
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Source timestamp as a 4 byte field
    pub fn put_timestamp(&mut self, timestamp: i64) -> &mut Self {
        self.buf.put_u32(timestamp.clamp(0, u32::MAX as i64) as u32);
        self
    }

    /// Zero-padded, truncated fixed-width string
    pub fn put_fixed(&mut self, value: &str, width: usize) -> &mut Self {
        let bytes = value.as_bytes();
        let n = bytes.len().min(width);
        self.buf.put_slice(&bytes[..n]);
        self.buf.put_bytes(0, width - n);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Prefix the header. `content_len` bytes are streamed after the result.
    pub fn finish(self, cmd: u8, content_len: u64) -> Bytes {
        self.finish_with_status(cmd, status::OK, content_len)
    }

    /// Like `finish`, with a request status in the header
    pub fn finish_with_status(self, cmd: u8, status: u8, content_len: u64) -> Bytes {
        let header = Header {
            body_len: self.buf.len() as u64 + content_len,
            cmd,
            status,
        };
        let mut packet = BytesMut::with_capacity(HEADER_SIZE + self.buf.len());
        packet.put_slice(&header.to_bytes());
        packet.put_slice(&self.buf);
        packet.freeze()
    }
}

impl Default for BodyWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub body: Bytes,
}

/// Read one response, validating the header
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = Header::from_bytes(&header_bytes);

    if header.cmd != cmd::RESP {
        return Err(Error::Protocol(format!(
            "expected response cmd {}, got {}",
            cmd::RESP,
            header.cmd
        )));
    }
    if header.body_len > MAX_RESPONSE_BODY {
        return Err(Error::Protocol(format!(
            "response body too large: {} bytes",
            header.body_len
        )));
    }

    let mut body = vec![0u8; header.body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok(Response {
        status: header.status,
        body: Bytes::from(body),
    })
}
