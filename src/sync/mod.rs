//! Sync Module
//!
//! Per-peer replication: checkpoints, batch building, parallel dispatch and
//! the session state machine that drives them.

mod batch;
mod executor;
mod manager;
mod mark;
mod pool;
mod session;

pub use batch::{BatchBuilder, BatchItem, DispatchBatch};
pub use executor::PeerSyncer;
pub use manager::SyncManager;
pub use mark::{MarkStore, ReaderCursor};
pub use pool::{BatchResult, RecordSyncer, SkipReason, SyncOutcome, WorkerPool};
pub use session::{PeerSyncSession, SyncContext};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Process-wide stop flag shared by the writer, sessions and workers
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns true when shutdown was triggered.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.rx.clone();
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            _ = rx.wait_for(|stop| *stop) => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
