//! Binlog Reader
//!
//! Sequential cursor over the segment sequence. Each peer session owns one
//! reader; the reader pre-reads into a local buffer, follows rotation and
//! can be rewound to any earlier record boundary.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use super::record::BinlogRecord;
use super::{BinlogPaths, BinlogPosition, BinlogWriter};
use crate::error::{Error, Result};

/// A decoded record with its boundaries in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub record: BinlogRecord,
    /// Position of the first byte of the record
    pub start: BinlogPosition,
    /// Position right after the record's newline
    pub end: BinlogPosition,
}

/// Outcome of one read step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Record(ReadRecord),
    /// Moved to the start of the next segment; the caller checkpoints before reading on
    Rotated(BinlogPosition),
    /// Nothing more has been flushed yet
    EndOfLog,
}

pub struct BinlogReader {
    paths: BinlogPaths,
    writer: Arc<BinlogWriter>,
    reader_id: String,
    file: File,
    index: u32,
    /// Segment offset of `buffer[0]`
    buffer_offset: u64,
    buffer: Vec<u8>,
    /// Consumed bytes of `buffer`
    pos: usize,
    capacity: usize,
    /// Dropping the remainder of an oversized line
    discarding: bool,
}

impl BinlogReader {
    /// Open a reader positioned at `start` and register it with the writer
    pub fn open(writer: Arc<BinlogWriter>, reader_id: &str, start: BinlogPosition) -> Result<Self> {
        let paths = writer.paths().clone();
        let capacity = writer.config().read_buffer_size.max(1024);
        let mut file = open_segment(&paths, start.index)?;

        let len = file.metadata()?.len();
        if start.offset > len {
            return Err(Error::Binlog(format!(
                "offset {} is beyond the end of segment {} ({} bytes)",
                start.offset, start.index, len
            )));
        }
        file.seek(SeekFrom::Start(start.offset))?;
        writer.register_reader(reader_id, start.index)?;

        tracing::debug!("Binlog reader {} opened at {}", reader_id, start);

        Ok(Self {
            paths,
            writer,
            reader_id: reader_id.to_string(),
            file,
            index: start.index,
            buffer_offset: start.offset,
            buffer: Vec::with_capacity(capacity),
            pos: 0,
            capacity,
            discarding: false,
        })
    }

    /// Position of the next unread record
    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.index, self.buffer_offset + self.pos as u64)
    }

    /// Read the next record, following rotation into newer segments
    pub fn read_next(&mut self) -> Result<ReadResult> {
        loop {
            if let Some(newline) = self.buffer[self.pos..].iter().position(|&b| b == b'\n') {
                let start = self.position();
                let line_start = self.pos;
                self.pos += newline + 1;

                if self.discarding {
                    self.discarding = false;
                    continue;
                }

                let end = self.position();
                let line = std::str::from_utf8(&self.buffer[line_start..line_start + newline])
                    .map_err(|_| malformed(start, "line is not valid UTF-8"))?;
                let record = BinlogRecord::parse_line(line).map_err(|reason| malformed(start, &reason))?;
                return Ok(ReadResult::Record(ReadRecord { record, start, end }));
            }

            if self.buffer.len() - self.pos >= self.capacity {
                let start = self.position();
                let reported = self.discarding;
                self.discard_buffer();
                self.discarding = true;
                if !reported {
                    return Err(malformed(start, "line exceeds the read buffer"));
                }
            }

            // Snapshot before reading: if this segment was already sealed, an
            // empty read really is its end.
            let writable = self.writer.current_index()?;
            if self.fill_buffer()? > 0 {
                continue;
            }

            if self.index >= writable {
                return Ok(ReadResult::EndOfLog);
            }

            if self.pos < self.buffer.len() && !self.discarding {
                let start = self.position();
                self.discard_buffer();
                return Err(malformed(start, "sealed segment ends without a newline"));
            }

            self.open_at(BinlogPosition::new(self.index + 1, 0))?;
            tracing::debug!("Binlog reader {} rotated to segment {}", self.reader_id, self.index);
            return Ok(ReadResult::Rotated(self.position()));
        }
    }

    /// Move back (or forward) to a record boundary
    pub fn rewind_to(&mut self, target: BinlogPosition) -> Result<()> {
        let buffered_end = self.buffer_offset + self.buffer.len() as u64;
        if target.index == self.index && target.offset >= self.buffer_offset && target.offset <= buffered_end {
            self.pos = (target.offset - self.buffer_offset) as usize;
            self.discarding = false;
            return Ok(());
        }
        self.open_at(target)
    }

    /// Discard records older than `until_timestamp`, stopping right before
    /// the first record at or after it. Returns the number of records skipped.
    pub fn skip_to(&mut self, until_timestamp: i64, skip_invalid: bool) -> Result<u64> {
        let mut skipped = 0;
        loop {
            match self.read_next() {
                Ok(ReadResult::Record(read)) => {
                    if read.record.timestamp >= until_timestamp {
                        self.rewind_to(read.start)?;
                        break;
                    }
                    skipped += 1;
                }
                Ok(ReadResult::Rotated(_)) => {}
                Ok(ReadResult::EndOfLog) => break,
                Err(e) if skip_invalid && e.is_malformed_record() => {
                    tracing::warn!("Binlog reader {} skipping invalid record: {}", self.reader_id, e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "Binlog reader {} skipped {} records older than {}, now at {}",
            self.reader_id,
            skipped,
            until_timestamp,
            self.position()
        );
        Ok(skipped)
    }

    fn open_at(&mut self, target: BinlogPosition) -> Result<()> {
        if target.index != self.index {
            self.file = open_segment(&self.paths, target.index)?;
            self.index = target.index;
            self.writer.register_reader(&self.reader_id, target.index)?;
        }
        self.file.seek(SeekFrom::Start(target.offset))?;
        self.buffer.clear();
        self.buffer_offset = target.offset;
        self.pos = 0;
        self.discarding = false;
        Ok(())
    }

    fn discard_buffer(&mut self) {
        self.buffer_offset += self.buffer.len() as u64;
        self.buffer.clear();
        self.pos = 0;
    }

    /// Slide the unread remainder to the front and read more
    fn fill_buffer(&mut self) -> Result<usize> {
        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.buffer_offset += self.pos as u64;
            self.pos = 0;
        }

        let used = self.buffer.len();
        self.buffer.resize(self.capacity, 0);
        let read = loop {
            match self.file.read(&mut self.buffer[used..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buffer.truncate(used);
                    return Err(e.into());
                }
            }
        };
        self.buffer.truncate(used + read);
        Ok(read)
    }
}

impl Drop for BinlogReader {
    fn drop(&mut self) {
        if let Err(e) = self.writer.unregister_reader(&self.reader_id) {
            tracing::warn!("Failed to unregister binlog reader {}: {}", self.reader_id, e);
        }
    }
}

fn malformed(at: BinlogPosition, reason: &str) -> Error {
    Error::MalformedRecord {
        index: at.index,
        offset: at.offset,
        reason: reason.to_string(),
    }
}

/// Open a segment, restoring it from its compressed archive when needed
fn open_segment(paths: &BinlogPaths, index: u32) -> Result<File> {
    let path = paths.segment_path(index);
    match File::open(&path) {
        Ok(file) => return Ok(file),
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    let archive = paths.archive_path(index);
    let packed = match std::fs::read(&archive) {
        Ok(packed) => packed,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::SegmentNotFound(index)),
        Err(e) => return Err(e.into()),
    };
    let data = lz4_flex::decompress_size_prepended(&packed)
        .map_err(|e| Error::Binlog(format!("decompress {:?}: {}", archive, e)))?;

    let tmp = path.with_extension(format!("{:03}.tmp", index));
    let mut out = File::create(&tmp)?;
    out.write_all(&data)?;
    out.sync_all()?;
    std::fs::rename(&tmp, &path)?;
    tracing::info!("Restored binlog segment {} from {:?}", index, archive);

    Ok(File::open(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::OpType;
    use crate::config::BinlogConfig;
    use std::path::Path;
    use tempfile::tempdir;

    fn open_writer(dir: &Path, segment_max_bytes: u64) -> Arc<BinlogWriter> {
        let config = BinlogConfig {
            write_buffer_size: 4096,
            flush_interval_ms: 20,
            segment_max_bytes,
            compress_old_segments: false,
            read_buffer_size: 1024,
        };
        Arc::new(BinlogWriter::open(dir.to_path_buf(), config).unwrap())
    }

    fn next_record(reader: &mut BinlogReader) -> ReadRecord {
        loop {
            match reader.read_next().unwrap() {
                ReadResult::Record(read) => return read,
                ReadResult::Rotated(_) => continue,
                ReadResult::EndOfLog => panic!("unexpected end of log"),
            }
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 1 << 20);
        let records = vec![
            BinlogRecord::new(100, OpType::SourceCreate, "M00/00/00/a"),
            BinlogRecord::new(101, OpType::SourceAppend, "M00/00/00/a").with_range(0, 512),
            BinlogRecord::new(102, OpType::ReplicaRename, "M00/00/00/b").with_source("M00/00/00/a"),
            BinlogRecord::new(103, OpType::SourceTruncate, "M00/00/00/b").with_resize(512, 10),
        ];
        for record in &records {
            writer.append_ex(record).unwrap();
        }

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        assert_eq!(reader.read_next().unwrap(), ReadResult::EndOfLog);

        writer.flush().unwrap();
        let mut offset = 0;
        for expected in &records {
            let read = next_record(&mut reader);
            assert_eq!(&read.record, expected);
            assert_eq!(read.start, BinlogPosition::new(0, offset));
            offset += expected.to_line().len() as u64;
            assert_eq!(read.end, BinlogPosition::new(0, offset));
        }
        assert_eq!(reader.read_next().unwrap(), ReadResult::EndOfLog);
    }

    #[test]
    fn test_follows_rotation() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 40);

        writer.append(1, OpType::SourceCreate, "M00/00/00/first", None).unwrap();
        writer.flush().unwrap();

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        assert_eq!(next_record(&mut reader).record.timestamp, 1);

        // Crosses the threshold and seals segment 0
        writer.append(2, OpType::SourceCreate, "M00/00/00/second", None).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.current_index().unwrap(), 1);

        writer.append(3, OpType::SourceDelete, "M00/00/00/first", None).unwrap();
        writer.flush().unwrap();

        assert_eq!(next_record(&mut reader).record.timestamp, 2);
        assert_eq!(reader.read_next().unwrap(), ReadResult::Rotated(BinlogPosition::new(1, 0)));
        assert_eq!(writer.min_segment_in_use().unwrap(), 1);

        let third = next_record(&mut reader);
        assert_eq!(third.record.timestamp, 3);
        assert_eq!(third.start, BinlogPosition::new(1, 0));
        assert_eq!(reader.read_next().unwrap(), ReadResult::EndOfLog);
    }

    #[test]
    fn test_rewind() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 40);
        for ts in 0..4 {
            writer.append(ts, OpType::SourceUpdate, "M00/00/00/file", None).unwrap();
            writer.flush().unwrap();
        }

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        let first = next_record(&mut reader);
        let second = next_record(&mut reader);
        reader.rewind_to(second.start).unwrap();
        assert_eq!(next_record(&mut reader), second);

        // Across segments
        next_record(&mut reader);
        let later = next_record(&mut reader);
        assert!(later.start.index > first.start.index);
        reader.rewind_to(first.start).unwrap();
        assert_eq!(next_record(&mut reader), first);
    }

    #[test]
    fn test_skip_to() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 1 << 20);
        for ts in [10, 20, 30, 40] {
            writer.append(ts, OpType::SourceCreate, &format!("M00/00/00/{}", ts), None).unwrap();
        }
        writer.flush().unwrap();

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        assert_eq!(reader.skip_to(25, false).unwrap(), 2);
        assert_eq!(next_record(&mut reader).record.timestamp, 30);

        let mut reader = BinlogReader::open(Arc::clone(&writer), "other", BinlogPosition::default()).unwrap();
        assert_eq!(reader.skip_to(100, false).unwrap(), 4);
        assert_eq!(reader.read_next().unwrap(), ReadResult::EndOfLog);
    }

    #[test]
    fn test_malformed_record_position() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 1 << 20);
        writer.append(1, OpType::SourceCreate, "M00/00/00/a", None).unwrap();
        writer.flush().unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(writer.paths().segment_path(0))
                .unwrap();
            file.write_all(b"garbage\n2 D M00/00/00/a\n").unwrap();
        }

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        next_record(&mut reader);
        match reader.read_next() {
            Err(Error::MalformedRecord { index, offset, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(offset, 16);
            }
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert_eq!(next_record(&mut reader).record.timestamp, 2);
    }

    #[test]
    fn test_restores_compressed_segment() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 10);
        writer.append(5, OpType::SourceDelete, "M00/00/00/gone", None).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.compress_sealed_segments().unwrap(), 1);
        assert!(!writer.paths().segment_path(0).exists());

        let mut reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        assert_eq!(next_record(&mut reader).record.filename, "M00/00/00/gone");
    }

    #[test]
    fn test_missing_segment() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 1 << 20);
        let result = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::new(9, 0));
        assert!(matches!(result, Err(Error::SegmentNotFound(9))));
    }

    #[test]
    fn test_drop_unregisters() {
        let dir = tempdir().unwrap();
        let writer = open_writer(dir.path(), 10);
        writer.append(1, OpType::SourceDelete, "M00/00/00/x", None).unwrap();
        writer.flush().unwrap();

        let reader = BinlogReader::open(Arc::clone(&writer), "peer", BinlogPosition::default()).unwrap();
        assert_eq!(writer.min_segment_in_use().unwrap(), 0);
        drop(reader);
        assert_eq!(writer.min_segment_in_use().unwrap(), 1);
    }
}
