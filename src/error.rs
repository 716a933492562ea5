//! WolfSync Error Types

use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Binlog errors
    /// The binlog could not be written or synced. The log is the source of
    /// truth, so this always ends the process.
    #[error("Binlog write failed: {0}")]
    BinlogFatal(String),

    #[error("Binlog error: {0}")]
    Binlog(String),

    #[error("Binlog segment not found: {0}")]
    SegmentNotFound(u32),

    #[error("Malformed binlog record in segment {index} at offset {offset}: {reason}")]
    MalformedRecord {
        index: u32,
        offset: u64,
        reason: String,
    },

    // Checkpoint errors
    #[error("Mark file error: {0}")]
    Checkpoint(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer {peer} answered cmd {cmd} with status {status}")]
    PeerStatus { peer: String, cmd: u8, status: u8 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Membership errors
    #[error("Membership error: {0}")]
    Membership(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable after reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::PeerStatus { .. }
                | Error::Protocol(_)
                | Error::Membership(_)
        )
    }

    /// Check if this error must stop the whole process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BinlogFatal(_) | Error::Checkpoint(_))
    }

    /// Check if this error comes from an undecodable binlog line
    pub fn is_malformed_record(&self) -> bool {
        matches!(self, Error::MalformedRecord { .. })
    }

    /// Status byte returned by the peer, if this is a peer status error
    pub fn peer_status(&self) -> Option<u8> {
        match self {
            Error::PeerStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::ConnectionTimeout("10.0.0.2:23000".into()).is_retryable());
        assert!(!Error::ConnectionTimeout("10.0.0.2:23000".into()).is_fatal());
        assert!(Error::BinlogFatal("disk full".into()).is_fatal());
        assert!(Error::Checkpoint("rename failed".into()).is_fatal());

        let malformed = Error::MalformedRecord {
            index: 3,
            offset: 120,
            reason: "missing op type".into(),
        };
        assert!(malformed.is_malformed_record());
        assert!(!malformed.is_retryable());

        let status = Error::PeerStatus {
            peer: "storage-2".into(),
            cmd: 16,
            status: 2,
        };
        assert_eq!(status.peer_status(), Some(2));
    }
}
