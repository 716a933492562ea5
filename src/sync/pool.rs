//! Sync Worker Pool
//!
//! Runs the records of one dispatch batch in parallel and works out how far
//! the cursor may safely advance.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::batch::DispatchBatch;
use super::ShutdownSignal;
use crate::binlog::{BinlogPosition, BinlogRecord};
use crate::error::{Error, Result};

/// Why a record was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The local file is gone
    SourceMissing,
    /// The local file no longer covers the recorded range
    SourceShrunk,
    /// The local file exists again, a later record carries it
    SourceRecreated,
    /// Replica content records are never forwarded
    NotForwarded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::SourceMissing => "source file missing",
            SkipReason::SourceShrunk => "source file shrunk",
            SkipReason::SourceRecreated => "source file recreated",
            SkipReason::NotForwarded => "not forwarded",
        };
        f.write_str(reason)
    }
}

/// Result of replicating one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The peer already was in the target state
    AlreadyPresent,
    Skipped(SkipReason),
}

/// Replicates single records to one peer
#[async_trait]
pub trait RecordSyncer: Send + Sync {
    /// `at` is where the record starts in the binlog
    async fn sync_record(&self, record: &BinlogRecord, at: BinlogPosition) -> Result<SyncOutcome>;
}

/// What a batch achieved
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Where the cursor continues from
    pub resume_at: BinlogPosition,
    /// Rows consumed up to `resume_at`
    pub scanned_rows: u64,
    pub synced_rows: u64,
    pub skipped_rows: u64,
    /// First failure in batch order
    pub error: Option<Error>,
    /// Batch index of the failed record
    pub failed_at: Option<usize>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Bounded set of worker slots shared by all peer sessions
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Grow the pool when another peer joins
    pub fn add_slots(&self, count: usize) {
        self.slots.add_permits(count);
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Replicate every record of `batch`, in parallel when it has more than one
    pub async fn execute_batch(
        &self,
        batch: &DispatchBatch,
        syncer: Arc<dyn RecordSyncer>,
        shutdown: &ShutdownSignal,
    ) -> BatchResult {
        let outcomes = if batch.len() == 1 {
            let item = &batch.items[0];
            vec![syncer.sync_record(&item.record, item.start).await]
        } else {
            let handles: Vec<_> = batch
                .items
                .iter()
                .map(|item| {
                    let record = item.record.clone();
                    let at = item.start;
                    let syncer = Arc::clone(&syncer);
                    let slots = Arc::clone(&self.slots);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if shutdown.is_triggered() {
                            return Err(Error::ShuttingDown);
                        }
                        let _permit = slots.acquire_owned().await.map_err(|_| Error::ShuttingDown)?;
                        if shutdown.is_triggered() {
                            return Err(Error::ShuttingDown);
                        }
                        syncer.sync_record(&record, at).await
                    })
                })
                .collect();

            futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|joined| joined.unwrap_or_else(|e| Err(Error::Network(format!("sync task aborted: {}", e)))))
                .collect()
        };

        summarize(batch, outcomes)
    }
}

/// Fold per-record outcomes, in batch order, into a batch result
fn summarize(batch: &DispatchBatch, outcomes: Vec<Result<SyncOutcome>>) -> BatchResult {
    let mut result = BatchResult {
        resume_at: batch.end,
        scanned_rows: batch.leading_rows,
        ..Default::default()
    };

    for (k, (item, outcome)) in batch.items.iter().zip(outcomes).enumerate() {
        match outcome {
            Ok(SyncOutcome::Synced | SyncOutcome::AlreadyPresent) => result.synced_rows += 1,
            Ok(SyncOutcome::Skipped(reason)) => {
                tracing::debug!("Skipped {}: {}", item.record, reason);
                result.skipped_rows += 1;
            }
            Err(e) => {
                result.resume_at = item.start;
                result.error = Some(e);
                result.failed_at = Some(k);
                return result;
            }
        }
        result.scanned_rows += item.scan_rows;
    }
    result
}
