//! Sync request encoders
//!
//! One variant per wire operation. Each variant knows its command code, how
//! to frame its fixed part, how many content bytes follow, and which
//! non-zero statuses are acceptable outcomes.

use bytes::Bytes;

use super::{cmd, status, BodyWriter, Response, GROUP_NAME_MAX_LEN, STORAGE_ID_MAX_LEN};
use crate::error::{Error, Result};

/// A request sent to a peer storage node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Identify this node to the peer
    ReportServerId { storage_id: String },
    /// Keepalive probe
    ActiveTest,
    /// Whole file transfer, followed by `size` content bytes.
    ///
    /// With `exists` set the peer already holds identical content: only the
    /// head is sent, flagged EEXIST, so the peer still logs the operation.
    Copy {
        update: bool,
        exists: bool,
        timestamp: i64,
        filename: String,
        size: u64,
    },
    /// Byte range transfer, followed by `length` content bytes
    Range {
        modify: bool,
        timestamp: i64,
        filename: String,
        offset: u64,
        length: u64,
    },
    Truncate {
        timestamp: i64,
        filename: String,
        old_size: u64,
        new_size: u64,
    },
    Delete { timestamp: i64, filename: String },
    Rename {
        timestamp: i64,
        dest: String,
        src: String,
    },
    Link {
        timestamp: i64,
        dest: String,
        src: String,
    },
    QueryFileInfo { filename: String },
}

/// How a response status is to be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusVerdict {
    /// The peer applied the request
    Done,
    /// The peer already was in the target state
    Benign,
    /// The peer lacks a file the request depends on
    Missing,
    /// Any other failure
    Rejected(u8),
}

impl StatusVerdict {
    pub fn is_success(self) -> bool {
        matches!(self, StatusVerdict::Done | StatusVerdict::Benign)
    }
}

/// Peer-side file metadata returned by QUERY_FILE_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub create_timestamp: Option<i64>,
}

impl FileInfo {
    pub fn decode(response: &Response) -> Result<Self> {
        let body = &response.body;
        if body.len() < 8 {
            return Err(Error::Protocol(format!(
                "file info body too short: {} bytes",
                body.len()
            )));
        }
        let size = be_u64(&body[0..8]);
        let create_timestamp = (body.len() >= 16).then(|| be_u64(&body[8..16]) as i64);
        Ok(Self {
            size,
            create_timestamp,
        })
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

impl SyncRequest {
    pub fn cmd(&self) -> u8 {
        match self {
            SyncRequest::ReportServerId { .. } => cmd::REPORT_SERVER_ID,
            SyncRequest::ActiveTest => cmd::ACTIVE_TEST,
            SyncRequest::Copy { update: false, .. } => cmd::SYNC_CREATE_FILE,
            SyncRequest::Copy { update: true, .. } => cmd::SYNC_UPDATE_FILE,
            SyncRequest::Range { modify: false, .. } => cmd::SYNC_APPEND_FILE,
            SyncRequest::Range { modify: true, .. } => cmd::SYNC_MODIFY_FILE,
            SyncRequest::Truncate { .. } => cmd::SYNC_TRUNCATE_FILE,
            SyncRequest::Delete { .. } => cmd::SYNC_DELETE_FILE,
            SyncRequest::Rename { .. } => cmd::SYNC_RENAME_FILE,
            SyncRequest::Link { .. } => cmd::SYNC_CREATE_LINK,
            SyncRequest::QueryFileInfo { .. } => cmd::QUERY_FILE_INFO,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SyncRequest::ReportServerId { .. } => "report_server_id",
            SyncRequest::ActiveTest => "active_test",
            SyncRequest::Copy { update: false, .. } => "create",
            SyncRequest::Copy { update: true, .. } => "update",
            SyncRequest::Range { modify: false, .. } => "append",
            SyncRequest::Range { modify: true, .. } => "modify",
            SyncRequest::Truncate { .. } => "truncate",
            SyncRequest::Delete { .. } => "delete",
            SyncRequest::Rename { .. } => "rename",
            SyncRequest::Link { .. } => "link",
            SyncRequest::QueryFileInfo { .. } => "query_file_info",
        }
    }

    /// Content bytes `(offset, length)` of the local file streamed after the head
    pub fn content_range(&self) -> Option<(u64, u64)> {
        match self {
            SyncRequest::Copy { exists: true, .. } => None,
            SyncRequest::Copy { size, .. } => Some((0, *size)),
            SyncRequest::Range { offset, length, .. } => Some((*offset, *length)),
            _ => None,
        }
    }

    /// Filename whose content is streamed, if any
    pub fn content_filename(&self) -> Option<&str> {
        match self {
            SyncRequest::Copy { exists: true, .. } => None,
            SyncRequest::Copy { filename, .. } | SyncRequest::Range { filename, .. } => Some(filename.as_str()),
            _ => None,
        }
    }

    /// Header plus fixed body; content bytes, if any, follow separately
    pub fn encode_head(&self, group_name: &str) -> Bytes {
        let mut body = BodyWriter::new();
        match self {
            SyncRequest::ReportServerId { storage_id } => {
                body.put_fixed(storage_id, STORAGE_ID_MAX_LEN);
            }
            SyncRequest::ActiveTest => {}
            SyncRequest::Copy {
                timestamp,
                filename,
                size,
                ..
            } => {
                body.put_u64(filename.len() as u64)
                    .put_u64(*size)
                    .put_timestamp(*timestamp)
                    .put_fixed(group_name, GROUP_NAME_MAX_LEN)
                    .put_str(filename);
            }
            SyncRequest::Range {
                timestamp,
                filename,
                offset,
                length,
                ..
            } => {
                body.put_u64(filename.len() as u64)
                    .put_u64(*offset)
                    .put_u64(*length)
                    .put_timestamp(*timestamp)
                    .put_fixed(group_name, GROUP_NAME_MAX_LEN)
                    .put_str(filename);
            }
            SyncRequest::Truncate {
                timestamp,
                filename,
                old_size,
                new_size,
            } => {
                body.put_u64(filename.len() as u64)
                    .put_u64(*old_size)
                    .put_u64(*new_size)
                    .put_timestamp(*timestamp)
                    .put_fixed(group_name, GROUP_NAME_MAX_LEN)
                    .put_str(filename);
            }
            SyncRequest::Delete { timestamp, filename } => {
                body.put_timestamp(*timestamp)
                    .put_fixed(group_name, GROUP_NAME_MAX_LEN)
                    .put_str(filename);
            }
            SyncRequest::Rename { timestamp, dest, src } | SyncRequest::Link { timestamp, dest, src } => {
                body.put_u64(dest.len() as u64)
                    .put_u64(src.len() as u64)
                    .put_timestamp(*timestamp)
                    .put_fixed(group_name, GROUP_NAME_MAX_LEN)
                    .put_str(dest)
                    .put_str(src);
            }
            SyncRequest::QueryFileInfo { filename } => {
                body.put_fixed(group_name, GROUP_NAME_MAX_LEN).put_str(filename);
            }
        }

        let content_len = self.content_range().map_or(0, |(_, len)| len);
        body.finish_with_status(self.cmd(), self.request_status(), content_len)
    }

    /// Status byte carried by the request header
    pub fn request_status(&self) -> u8 {
        match self {
            SyncRequest::Copy { exists: true, .. } => status::EEXIST,
            _ => status::OK,
        }
    }

    /// Classify a response status for this request
    pub fn verdict(&self, code: u8) -> StatusVerdict {
        if code == status::OK {
            return StatusVerdict::Done;
        }
        match (self, code) {
            (SyncRequest::Copy { .. }, status::EEXIST) => StatusVerdict::Benign,
            (SyncRequest::Range { .. }, status::EEXIST) => StatusVerdict::Benign,
            (SyncRequest::Range { .. }, status::ENOENT) => StatusVerdict::Missing,
            (SyncRequest::Truncate { .. }, status::EEXIST) => StatusVerdict::Benign,
            (SyncRequest::Truncate { .. }, status::ENOENT) => StatusVerdict::Missing,
            (SyncRequest::Delete { .. }, status::ENOENT) => StatusVerdict::Benign,
            (SyncRequest::Rename { .. }, status::EEXIST) => StatusVerdict::Benign,
            (SyncRequest::Rename { .. }, status::ENOENT) => StatusVerdict::Missing,
            (SyncRequest::Link { .. }, status::EEXIST | status::ENOENT) => StatusVerdict::Benign,
            (SyncRequest::QueryFileInfo { .. }, status::ENOENT) => StatusVerdict::Missing,
            _ => StatusVerdict::Rejected(code),
        }
    }
}
