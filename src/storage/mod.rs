//! Storage Module
//!
//! Access to the local files named by binlog records. Logical filenames look
//! like `M00/0A/1F/name`: `MNN` is the hex index of a store path and the rest
//! lives under `<store_path>/data/`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};

/// Metadata of a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Modification time, seconds since epoch
    pub mtime: i64,
    pub is_symlink: bool,
}

/// Local file access used by the sync executor
pub trait FileStore: Send + Sync {
    /// Physical path of a logical filename
    fn resolve_physical_path(&self, filename: &str) -> Result<PathBuf>;

    /// Stat following symlinks, `None` when the file does not exist
    fn stat_file(&self, filename: &str) -> Result<Option<FileStat>>;

    /// Stat without following symlinks
    fn lstat_file(&self, filename: &str) -> Result<Option<FileStat>>;

    /// Read exactly `length` bytes at `offset`
    fn read_range(&self, filename: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Logical filename a link points to, `None` if it is not a link
    fn resolve_link(&self, filename: &str) -> Result<Option<String>>;
}

/// Split `MNN/rest` into the store path index and the relative part
pub fn split_filename(filename: &str) -> Result<(usize, &str)> {
    let invalid = || Error::Protocol(format!("invalid logical filename: {}", filename));
    let (prefix, rest) = filename.split_once('/').ok_or_else(invalid)?;
    if prefix.len() != 3 || !prefix.starts_with('M') || rest.is_empty() {
        return Err(invalid());
    }
    let index = usize::from_str_radix(&prefix[1..], 16).map_err(|_| invalid())?;
    Ok((index, rest))
}

/// Files stored directly on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    store_paths: Vec<PathBuf>,
}

impl LocalFileStore {
    pub fn new(store_paths: Vec<PathBuf>) -> Self {
        Self { store_paths }
    }

    /// Map a physical path back to its logical filename
    pub fn logical_name(&self, physical: &Path) -> Result<String> {
        let text = physical.to_string_lossy();
        let marker = "/data/";
        let at = text
            .rfind(marker)
            .ok_or_else(|| Error::Protocol(format!("path {:?} is not inside a store path", physical)))?;
        let (store, rel) = (&text[..at], &text[at + marker.len()..]);

        let index = match self.store_paths.iter().position(|p| Path::new(store) == p.as_path()) {
            Some(index) => index,
            None if self.store_paths.len() == 1 => 0,
            None => {
                return Err(Error::Protocol(format!(
                    "store path {:?} of {:?} is not configured",
                    store, physical
                )))
            }
        };
        Ok(format!("M{:02X}/{}", index, rel))
    }

    fn stat_with(&self, filename: &str, follow: bool) -> Result<Option<FileStat>> {
        let path = self.resolve_physical_path(filename)?;
        let metadata = if follow {
            std::fs::metadata(&path)
        } else {
            std::fs::symlink_metadata(&path)
        };
        match metadata {
            Ok(metadata) => Ok(Some(FileStat {
                size: metadata.len(),
                mtime: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs() as i64),
                is_symlink: metadata.file_type().is_symlink(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl FileStore for LocalFileStore {
    fn resolve_physical_path(&self, filename: &str) -> Result<PathBuf> {
        let (index, rest) = split_filename(filename)?;
        let store = self.store_paths.get(index).ok_or_else(|| {
            Error::Protocol(format!("store path index {} of {} is not configured", index, filename))
        })?;
        Ok(store.join("data").join(rest))
    }

    fn stat_file(&self, filename: &str) -> Result<Option<FileStat>> {
        self.stat_with(filename, true)
    }

    fn lstat_file(&self, filename: &str) -> Result<Option<FileStat>> {
        self.stat_with(filename, false)
    }

    fn read_range(&self, filename: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.resolve_physical_path(filename)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; length as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    fn resolve_link(&self, filename: &str) -> Result<Option<String>> {
        let path = self.resolve_physical_path(filename)?;
        let target = match std::fs::read_link(&path) {
            Ok(target) => target,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let target = if target.is_relative() {
            path.parent().map_or(target.clone(), |dir| dir.join(&target))
        } else {
            target
        };
        self.logical_name(&target).map(Some)
    }
}
