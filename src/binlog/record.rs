//! Binlog Records
//!
//! One line per file operation:
//! `"<timestamp> <op> <filename>[ <arg>[ <arg>]]\n"`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation recorded in the binlog
///
/// Source operations were performed on this node. Replica operations arrived
/// from another peer and are only forwarded to third peers while replaying
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    SourceCreate,
    SourceAppend,
    SourceDelete,
    SourceUpdate,
    SourceModify,
    SourceTruncate,
    SourceLink,
    SourceRename,
    ReplicaCreate,
    ReplicaAppend,
    ReplicaDelete,
    ReplicaUpdate,
    ReplicaModify,
    ReplicaTruncate,
    ReplicaLink,
    ReplicaRename,
}

/// What an operation does, independent of where it originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Create,
    Update,
    Append,
    Modify,
    Truncate,
    Delete,
    Link,
    Rename,
}

impl OpType {
    pub const ALL: [OpType; 16] = [
        OpType::SourceCreate,
        OpType::SourceAppend,
        OpType::SourceDelete,
        OpType::SourceUpdate,
        OpType::SourceModify,
        OpType::SourceTruncate,
        OpType::SourceLink,
        OpType::SourceRename,
        OpType::ReplicaCreate,
        OpType::ReplicaAppend,
        OpType::ReplicaDelete,
        OpType::ReplicaUpdate,
        OpType::ReplicaModify,
        OpType::ReplicaTruncate,
        OpType::ReplicaLink,
        OpType::ReplicaRename,
    ];

    /// Single character tag used on disk
    pub fn as_char(self) -> char {
        match self {
            OpType::SourceCreate => 'C',
            OpType::SourceAppend => 'A',
            OpType::SourceDelete => 'D',
            OpType::SourceUpdate => 'U',
            OpType::SourceModify => 'M',
            OpType::SourceTruncate => 'T',
            OpType::SourceLink => 'L',
            OpType::SourceRename => 'R',
            OpType::ReplicaCreate => 'c',
            OpType::ReplicaAppend => 'a',
            OpType::ReplicaDelete => 'd',
            OpType::ReplicaUpdate => 'u',
            OpType::ReplicaModify => 'm',
            OpType::ReplicaTruncate => 't',
            OpType::ReplicaLink => 'l',
            OpType::ReplicaRename => 'r',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        OpType::ALL.iter().copied().find(|op| op.as_char() == c)
    }

    pub fn is_source(self) -> bool {
        self.as_char().is_ascii_uppercase()
    }

    pub fn kind(self) -> OpKind {
        match self.as_char().to_ascii_uppercase() {
            'C' => OpKind::Create,
            'A' => OpKind::Append,
            'D' => OpKind::Delete,
            'U' => OpKind::Update,
            'M' => OpKind::Modify,
            'T' => OpKind::Truncate,
            'L' => OpKind::Link,
            _ => OpKind::Rename,
        }
    }

    /// Whether a replica record of this type may be forwarded to third peers.
    ///
    /// Replica appends, modifies and truncates are never forwarded; the whole
    /// file is carried by the create/update that precedes them.
    pub fn is_forwardable_replica(self) -> bool {
        !self.is_source()
            && !matches!(self.kind(), OpKind::Append | OpKind::Modify | OpKind::Truncate)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Numeric arguments carried by content and size operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extent {
    /// Byte range written by an append or modify
    Range { offset: u64, length: u64 },
    /// Size change of a truncate
    Resize { old_size: u64, new_size: u64 },
}

/// A single binlog record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogRecord {
    /// Seconds since epoch of the source operation
    pub timestamp: i64,
    pub op_type: OpType,
    /// Logical filename, `MNN/xx/yy/name`
    pub filename: String,
    /// Link target or rename source
    pub src_filename: Option<String>,
    pub extent: Option<Extent>,
}

impl BinlogRecord {
    pub fn new(timestamp: i64, op_type: OpType, filename: impl Into<String>) -> Self {
        Self {
            timestamp,
            op_type,
            filename: filename.into(),
            src_filename: None,
            extent: None,
        }
    }

    pub fn with_source(mut self, src_filename: impl Into<String>) -> Self {
        self.src_filename = Some(src_filename.into());
        self
    }

    pub fn with_range(mut self, offset: u64, length: u64) -> Self {
        self.extent = Some(Extent::Range { offset, length });
        self
    }

    pub fn with_resize(mut self, old_size: u64, new_size: u64) -> Self {
        self.extent = Some(Extent::Resize { old_size, new_size });
        self
    }

    /// Every filename this record touches
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.filename.as_str()).chain(self.src_filename.as_deref())
    }

    /// True when both records touch at least one common filename
    pub fn conflicts_with(&self, other: &BinlogRecord) -> bool {
        self.names().any(|a| other.names().any(|b| a == b))
    }

    /// Check the record can be encoded as one well-formed line
    pub fn validate(&self) -> Result<(), String> {
        for name in self.names() {
            if name.is_empty() {
                return Err("empty filename".into());
            }
            if name.contains(['\n', '\r', ' ']) {
                return Err(format!("filename contains a separator: {:?}", name));
            }
        }

        let needs_range = matches!(self.op_type.kind(), OpKind::Append | OpKind::Modify);
        let needs_resize = self.op_type.kind() == OpKind::Truncate;
        match self.extent {
            Some(Extent::Range { .. }) if !needs_range => {
                Err(format!("op {} does not carry a byte range", self.op_type))
            }
            Some(Extent::Resize { .. }) if !needs_resize => {
                Err(format!("op {} does not carry a size change", self.op_type))
            }
            None if needs_range || needs_resize => {
                Err(format!("op {} requires numeric arguments", self.op_type))
            }
            _ => {
                if self.src_filename.is_some()
                    && !matches!(self.op_type.kind(), OpKind::Link | OpKind::Rename)
                {
                    return Err(format!("op {} does not carry a source filename", self.op_type));
                }
                if self.src_filename.is_none() && self.op_type.kind() == OpKind::Rename {
                    return Err("rename requires a source filename".into());
                }
                Ok(())
            }
        }
    }

    /// Encode as a binlog line, including the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.timestamp, self.op_type, self.filename);
        match (&self.src_filename, self.extent) {
            (Some(src), _) => {
                line.push(' ');
                line.push_str(src);
            }
            (None, Some(Extent::Range { offset, length })) => {
                line.push_str(&format!(" {} {}", offset, length));
            }
            (None, Some(Extent::Resize { old_size, new_size })) => {
                line.push_str(&format!(" {} {}", old_size, new_size));
            }
            (None, None) => {}
        }
        line.push('\n');
        line
    }

    /// Decode one line (without the trailing newline)
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split(' ');

        let timestamp = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or("missing timestamp")?
            .parse::<i64>()
            .map_err(|_| "invalid timestamp".to_string())?;

        let op = fields.next().ok_or("missing op type")?;
        let mut chars = op.chars();
        let op_type = match (chars.next(), chars.next()) {
            (Some(c), None) => OpType::from_char(c).ok_or_else(|| format!("unknown op type {:?}", op))?,
            _ => return Err(format!("invalid op type {:?}", op)),
        };

        let filename = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or("missing filename")?
            .to_string();

        let args: Vec<&str> = fields.collect();
        let mut record = BinlogRecord::new(timestamp, op_type, filename);

        match op_type.kind() {
            OpKind::Append | OpKind::Modify | OpKind::Truncate => {
                let [first, second] = args.as_slice() else {
                    return Err(format!("op {} expects 2 numeric arguments, got {}", op_type, args.len()));
                };
                let first: u64 = first.parse().map_err(|_| format!("invalid number {:?}", first))?;
                let second: u64 = second.parse().map_err(|_| format!("invalid number {:?}", second))?;
                record = if op_type.kind() == OpKind::Truncate {
                    record.with_resize(first, second)
                } else {
                    record.with_range(first, second)
                };
            }
            OpKind::Link | OpKind::Rename => match args.as_slice() {
                [] if op_type.kind() == OpKind::Link => {}
                [src] if !src.is_empty() => record = record.with_source(*src),
                _ => return Err(format!("op {} expects a single source filename", op_type)),
            },
            OpKind::Create | OpKind::Update | OpKind::Delete => {
                if !args.is_empty() {
                    return Err(format!("unexpected trailing fields for op {}", op_type));
                }
            }
        }

        Ok(record)
    }
}

impl fmt::Display for BinlogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_chars() {
        for op in OpType::ALL {
            assert_eq!(OpType::from_char(op.as_char()), Some(op));
        }
        assert_eq!(OpType::from_char('X'), None);
        assert!(OpType::SourceRename.is_source());
        assert_eq!(OpType::ReplicaTruncate.kind(), OpKind::Truncate);
    }

    #[test]
    fn test_forwardable_replicas() {
        assert!(OpType::ReplicaCreate.is_forwardable_replica());
        assert!(OpType::ReplicaRename.is_forwardable_replica());
        assert!(!OpType::ReplicaAppend.is_forwardable_replica());
        assert!(!OpType::ReplicaModify.is_forwardable_replica());
        assert!(!OpType::ReplicaTruncate.is_forwardable_replica());
        assert!(!OpType::SourceCreate.is_forwardable_replica());
    }

    #[test]
    fn test_line_format() {
        let create = BinlogRecord::new(100, OpType::SourceCreate, "M00/00/01/a.txt");
        assert_eq!(create.to_line(), "100 C M00/00/01/a.txt\n");

        let rename = BinlogRecord::new(101, OpType::SourceRename, "M00/00/01/b.txt")
            .with_source("M00/00/01/a.txt");
        assert_eq!(rename.to_line(), "101 R M00/00/01/b.txt M00/00/01/a.txt\n");

        let append = BinlogRecord::new(102, OpType::SourceAppend, "M00/00/01/b.txt").with_range(10, 20);
        assert_eq!(append.to_line(), "102 A M00/00/01/b.txt 10 20\n");
    }

    #[test]
    fn test_parse_line() {
        let record = BinlogRecord::parse_line("1700000000 T M01/0A/0B/f 300 120").unwrap();
        assert_eq!(record.op_type, OpType::SourceTruncate);
        assert_eq!(record.extent, Some(Extent::Resize { old_size: 300, new_size: 120 }));

        let link = BinlogRecord::parse_line("5 l M00/00/00/dst M00/00/00/src").unwrap();
        assert_eq!(link.src_filename.as_deref(), Some("M00/00/00/src"));

        let bare_link = BinlogRecord::parse_line("5 L M00/00/00/dst").unwrap();
        assert!(bare_link.src_filename.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BinlogRecord::parse_line("").is_err());
        assert!(BinlogRecord::parse_line("abc C M00/x").is_err());
        assert!(BinlogRecord::parse_line("1 Z M00/x").is_err());
        assert!(BinlogRecord::parse_line("1 CC M00/x").is_err());
        assert!(BinlogRecord::parse_line("1 C").is_err());
        assert!(BinlogRecord::parse_line("1 A M00/x 10").is_err());
        assert!(BinlogRecord::parse_line("1 R M00/x").is_err());
        assert!(BinlogRecord::parse_line("1 D M00/x extra").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(BinlogRecord::new(1, OpType::SourceCreate, "M00/a b").validate().is_err());
        assert!(BinlogRecord::new(1, OpType::SourceAppend, "M00/a").validate().is_err());
        assert!(BinlogRecord::new(1, OpType::SourceRename, "M00/a").validate().is_err());
        assert!(BinlogRecord::new(1, OpType::SourceLink, "M00/a").validate().is_ok());
        assert!(BinlogRecord::new(1, OpType::SourceDelete, "M00/a")
            .with_source("M00/b")
            .validate()
            .is_err());
    }

    #[test]
    fn test_conflicts() {
        let a = BinlogRecord::new(1, OpType::SourceCreate, "M00/a");
        let b = BinlogRecord::new(1, OpType::SourceDelete, "M00/b");
        let rename = BinlogRecord::new(1, OpType::SourceRename, "M00/c").with_source("M00/a");
        assert!(!a.conflicts_with(&b));
        assert!(rename.conflicts_with(&a));
        assert!(a.conflicts_with(&rename));
        assert!(a.conflicts_with(&a.clone()));
    }
}
