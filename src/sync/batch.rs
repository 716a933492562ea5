//! Dispatch Batches
//!
//! Groups consecutive binlog records that touch disjoint files so they can be
//! replicated in parallel. Records the peer does not need are consumed on the
//! way and only counted.

use std::collections::HashSet;

use super::mark::ReaderCursor;
use crate::binlog::{BinlogPosition, BinlogReader, BinlogRecord, ReadResult};
use crate::error::{Error, Result};

/// A record queued for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub record: BinlogRecord,
    pub start: BinlogPosition,
    pub end: BinlogPosition,
    /// Rows consumed by this item: itself plus the unneeded records after it
    pub scan_rows: u64,
}

/// Conflict-free run of records read from one position
#[derive(Debug, Clone, Default)]
pub struct DispatchBatch {
    pub items: Vec<BatchItem>,
    /// Rows consumed before the first item
    pub leading_rows: u64,
    /// Position after everything consumed for this batch
    pub end: BinlogPosition,
    /// The reader moved to a new segment while building
    pub rotated: bool,
    /// Nothing more to read for now
    pub reached_end: bool,
}

impl DispatchBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Every row consumed, forwarded or not
    pub fn total_rows(&self) -> u64 {
        self.leading_rows + self.items.iter().map(|item| item.scan_rows).sum::<u64>()
    }

    fn count_skipped(&mut self) {
        match self.items.last_mut() {
            Some(item) => item.scan_rows += 1,
            None => self.leading_rows += 1,
        }
    }
}

/// Builds dispatch batches from a peer's reader
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    max_size: usize,
    skip_invalid: bool,
}

impl BatchBuilder {
    pub fn new(max_size: usize, skip_invalid: bool) -> Self {
        Self {
            max_size: max_size.max(1),
            skip_invalid,
        }
    }

    /// Read records until the batch is full, a conflict is found, the
    /// segment rotates or the log runs dry.
    ///
    /// A conflicting record is left unread and seeds the next batch. A
    /// malformed record fails an empty batch; otherwise the batch stops
    /// right before it.
    pub fn build(&self, reader: &mut BinlogReader, cursor: &ReaderCursor) -> Result<DispatchBatch> {
        let mut batch = DispatchBatch {
            end: reader.position(),
            ..Default::default()
        };
        let mut names: HashSet<String> = HashSet::new();

        while batch.items.len() < self.max_size {
            match reader.read_next() {
                Ok(ReadResult::Record(read)) => {
                    if !cursor.needs(&read.record) {
                        batch.count_skipped();
                        batch.end = read.end;
                        continue;
                    }

                    if read.record.names().any(|name| names.contains(name)) {
                        reader.rewind_to(read.start)?;
                        break;
                    }

                    names.extend(read.record.names().map(str::to_string));
                    batch.end = read.end;
                    batch.items.push(BatchItem {
                        record: read.record,
                        start: read.start,
                        end: read.end,
                        scan_rows: 1,
                    });
                }
                Ok(ReadResult::Rotated(position)) => {
                    batch.end = position;
                    batch.rotated = true;
                    break;
                }
                Ok(ReadResult::EndOfLog) => {
                    batch.reached_end = true;
                    break;
                }
                Err(e) if e.is_malformed_record() => {
                    if self.skip_invalid {
                        tracing::warn!("Skipping invalid binlog record: {}", e);
                        batch.count_skipped();
                        batch.end = reader.position();
                        continue;
                    }
                    if batch.is_empty() {
                        return Err(e);
                    }
                    if let Error::MalformedRecord { index, offset, .. } = e {
                        reader.rewind_to(BinlogPosition::new(index, offset))?;
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(batch)
    }
}
