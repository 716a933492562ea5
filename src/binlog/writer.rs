//! Binlog Writer
//!
//! Buffered appender for the binlog. All appends, flushes and rotations go
//! through one mutex so a reader never observes a torn segment boundary.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::record::{BinlogRecord, OpType};
use super::{BinlogPaths, BinlogPosition, SegmentIndex};
use crate::config::BinlogConfig;
use crate::error::{Error, Result};

/// Flush once fewer than this many bytes of the write buffer remain free
const FLUSH_SLACK: usize = 256;

/// Binlog writer shared by every local mutation path
pub struct BinlogWriter {
    paths: BinlogPaths,
    config: BinlogConfig,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    /// Open writable segment
    file: File,
    index: SegmentIndex,
    /// Bytes already flushed into the writable segment
    segment_size: u64,
    buffer: Vec<u8>,
    /// Segment each registered reader is positioned in
    readers: HashMap<String, u32>,
}

impl BinlogWriter {
    /// Open the binlog under `sync_dir`, resuming the writable segment
    pub fn open(sync_dir: PathBuf, config: BinlogConfig) -> Result<Self> {
        let paths = BinlogPaths::new(sync_dir);
        paths.ensure_dirs()?;

        let index = match SegmentIndex::load(&paths.index_path())? {
            Some(index) => index,
            None => {
                let index = SegmentIndex::default();
                index.save(&paths.index_path())?;
                index
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.segment_path(index.current_write))?;
        let segment_size = file.metadata()?.len();

        tracing::info!(
            "Binlog opened at segment {} ({} bytes) in {:?}",
            index.current_write,
            segment_size,
            paths.base_dir
        );

        let buffer = Vec::with_capacity(config.write_buffer_size);
        Ok(Self {
            paths,
            config,
            inner: Mutex::new(WriterInner {
                file,
                index,
                segment_size,
                buffer,
                readers: HashMap::new(),
            }),
        })
    }

    pub fn paths(&self) -> &BinlogPaths {
        &self.paths
    }

    pub fn config(&self) -> &BinlogConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::BinlogFatal("binlog writer lock poisoned".into()))
    }

    /// Append one operation
    pub fn append(
        &self,
        timestamp: i64,
        op_type: OpType,
        filename: &str,
        src_filename: Option<&str>,
    ) -> Result<()> {
        let mut record = BinlogRecord::new(timestamp, op_type, filename);
        record.src_filename = src_filename.map(str::to_string);
        self.append_ex(&record)
    }

    /// Append a record that may carry numeric arguments
    pub fn append_ex(&self, record: &BinlogRecord) -> Result<()> {
        record.validate().map_err(Error::Binlog)?;
        let line = record.to_line();

        let mut inner = self.lock()?;
        inner.buffer.extend_from_slice(line.as_bytes());
        if self.config.write_buffer_size.saturating_sub(inner.buffer.len()) < FLUSH_SLACK {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Write and fsync buffered records
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut WriterInner) -> Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let segment = inner.index.current_write;
        let written = inner.buffer.len() as u64;
        write_durable(&mut inner.file, &inner.buffer).map_err(|e| {
            tracing::error!("Binlog write to segment {} failed: {}", segment, e);
            Error::BinlogFatal(format!("write segment {}: {}", segment, e))
        })?;
        inner.buffer.clear();
        inner.segment_size += written;

        if inner.segment_size >= self.config.segment_max_bytes {
            self.rotate_locked(inner)?;
        }
        Ok(())
    }

    /// Seal the writable segment and open the next one
    fn rotate_locked(&self, inner: &mut WriterInner) -> Result<()> {
        let next = SegmentIndex {
            current_write: inner.index.current_write + 1,
            ..inner.index
        };
        next.save(&self.paths.index_path())
            .map_err(|e| Error::BinlogFatal(format!("persist binlog index: {}", e)))?;

        let path = self.paths.segment_path(next.current_write);
        if path.exists() {
            tracing::warn!("Binlog segment {:?} already exists, truncating", path);
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::BinlogFatal(format!("open segment {:?}: {}", path, e)))?;

        tracing::info!(
            "Binlog segment {} sealed at {} bytes, now writing segment {}",
            inner.index.current_write,
            inner.segment_size,
            next.current_write
        );

        inner.file = file;
        inner.index = next;
        inner.segment_size = 0;
        Ok(())
    }

    /// Index of the writable segment
    pub fn current_index(&self) -> Result<u32> {
        Ok(self.lock()?.index.current_write)
    }

    /// End of the flushed part of the log
    pub fn flushed_position(&self) -> Result<BinlogPosition> {
        let inner = self.lock()?;
        Ok(BinlogPosition::new(inner.index.current_write, inner.segment_size))
    }

    /// Register or move a reader in the watermark registry
    pub fn register_reader(&self, reader_id: &str, segment: u32) -> Result<()> {
        self.lock()?.readers.insert(reader_id.to_string(), segment);
        Ok(())
    }

    pub fn unregister_reader(&self, reader_id: &str) -> Result<()> {
        self.lock()?.readers.remove(reader_id);
        Ok(())
    }

    /// Lowest segment any reader (or the writer itself) still needs
    pub fn min_segment_in_use(&self) -> Result<u32> {
        let inner = self.lock()?;
        Ok(inner
            .readers
            .values()
            .copied()
            .fold(inner.index.current_write, u32::min))
    }

    /// Compress every sealed segment no reader references any more.
    ///
    /// Returns the number of segments compressed.
    pub fn compress_sealed_segments(&self) -> Result<usize> {
        let (from, until) = {
            let inner = self.lock()?;
            let watermark = inner
                .readers
                .values()
                .copied()
                .fold(inner.index.current_write, u32::min);
            (inner.index.current_compress, watermark)
        };
        if from >= until {
            return Ok(0);
        }

        let mut compressed = 0;
        for segment in from..until {
            let src = self.paths.segment_path(segment);
            if !src.exists() {
                continue;
            }
            let data = std::fs::read(&src)?;
            let packed = lz4_flex::compress_prepend_size(&data);

            let archive = self.paths.archive_path(segment);
            let tmp = archive.with_extension("lz4.tmp");
            let mut file = File::create(&tmp)?;
            file.write_all(&packed)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &archive)?;
            std::fs::remove_file(&src)?;

            tracing::debug!(
                "Compressed binlog segment {} ({} -> {} bytes)",
                segment,
                data.len(),
                packed.len()
            );
            compressed += 1;
        }

        let mut inner = self.lock()?;
        if until > inner.index.current_compress {
            inner.index.current_compress = until;
            inner.index.save(&self.paths.index_path())?;
        }
        Ok(compressed)
    }

    /// Periodic flush until shutdown, with a final flush on exit.
    ///
    /// A flush failure ends the loop with a fatal error.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush()?;

                    if self.config.compress_old_segments {
                        let writer = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || writer.compress_sealed_segments()).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(n)) => tracing::info!("Compressed {} sealed binlog segments", n),
                            Ok(Err(e)) => tracing::warn!("Binlog compression failed: {}", e),
                            Err(e) => tracing::warn!("Binlog compression task failed: {}", e),
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.close()
    }

    /// Flush and fsync the writable segment
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.flush_locked(&mut inner)?;
        inner
            .file
            .sync_all()
            .map_err(|e| Error::BinlogFatal(format!("sync binlog on close: {}", e)))?;
        tracing::info!(
            "Binlog closed at segment {} offset {}",
            inner.index.current_write,
            inner.segment_size
        );
        Ok(())
    }
}

fn write_durable(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data)?;
    file.sync_data()
}
