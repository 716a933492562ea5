//! Segment index file
//!
//! Records the writable segment and the compression watermark.

use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentIndex {
    /// Segment currently open for appends
    pub current_write: u32,
    /// Segments below this index have been compressed
    pub current_compress: u32,
}

impl SegmentIndex {
    /// Load the index, `None` when the file does not exist yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content).map(Some)
    }

    /// Parse either `key=value` lines or a legacy bare segment number
    pub fn parse(content: &str) -> Result<Self> {
        let trimmed = content.trim();
        if let Ok(current_write) = trimmed.parse::<u32>() {
            return Ok(Self {
                current_write,
                current_compress: 0,
            });
        }

        let mut current_write = None;
        let mut current_compress = 0;
        for line in trimmed.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|_| Error::Binlog(format!("invalid binlog index value: {}", line)))?;
            match key.trim() {
                "current_write" => current_write = Some(value),
                "current_compress" => current_compress = value,
                _ => {}
            }
        }

        let current_write = current_write
            .ok_or_else(|| Error::Binlog("binlog index has no current_write".into()))?;
        Ok(Self {
            current_write,
            current_compress,
        })
    }

    pub fn to_text(&self) -> String {
        format!(
            "current_write={}\ncurrent_compress={}\n",
            self.current_write, self.current_compress
        )
    }

    /// Write the index durably (temp file, fsync, rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("index.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(self.to_text().as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
