//! Sparse offset index for a segment
//!
//! Each segment's `.index` file maps relative offsets to byte positions in
//! the `.log` file so a fetch can seek near its target instead of scanning
//! from the start. Entries are fixed-size and strictly increasing in both
//! fields:
//!
//! ```text
//! +-------------------------+------------------------+
//! | relative_offset: u32 BE | file_position: u32 BE  |
//! +-------------------------+------------------------+
//! ```
//!
//! The index is sparse: the segment emits at most one entry per
//! `index_interval_bytes` of log growth, so a lookup lands at or before the
//! target record and the reader ships the prefix. The index is advisory;
//! corruption is recovered from by rescanning the `.log` and rewriting it.

use crate::error::{Result, VgError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Size of each index entry in bytes
pub const INDEX_ENTRY_SIZE: usize = 8;

/// An entry in the sparse index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset relative to the segment's base offset
    pub relative_offset: u32,
    /// Byte position in the `.log` file where the record's frame starts
    pub position: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.relative_offset.to_be_bytes());
        buf[4..8].copy_from_slice(&self.position.to_be_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Self {
        Self {
            relative_offset: u32::from_be_bytes(data[0..4].try_into().unwrap()),
            position: u32::from_be_bytes(data[4..8].try_into().unwrap()),
        }
    }
}

/// Sparse index for one segment, kept in memory and appended to disk
#[derive(Debug)]
pub struct OffsetIndex {
    path: PathBuf,
    entries: Vec<IndexEntry>,
    file: Option<File>,
}

impl OffsetIndex {
    /// Create a fresh, empty index (truncates any existing file)
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries: Vec::new(),
            file: Some(file),
        })
    }

    /// Load an existing index file, validating the monotonicity invariant.
    ///
    /// Returns `Err(Corrupt)` when entries are malformed or out of order;
    /// the caller rebuilds from the `.log` in that case.
    pub fn load(path: &Path, writable: bool) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        if data.len() % INDEX_ENTRY_SIZE != 0 {
            return Err(VgError::Corrupt(format!(
                "index {} has a torn entry ({} bytes)",
                path.display(),
                data.len()
            )));
        }

        let mut entries: Vec<IndexEntry> = Vec::with_capacity(data.len() / INDEX_ENTRY_SIZE);
        for chunk in data.chunks_exact(INDEX_ENTRY_SIZE) {
            let entry = IndexEntry::from_bytes(chunk);
            if let Some(last) = entries.last() {
                if entry.relative_offset <= last.relative_offset
                    || entry.position <= last.position
                {
                    return Err(VgError::Corrupt(format!(
                        "index {} entries not strictly increasing",
                        path.display()
                    )));
                }
            }
            entries.push(entry);
        }

        let file = if writable {
            Some(OpenOptions::new().append(true).open(path)?)
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            file,
        })
    }

    /// Load, falling back to an empty writable index when the file is
    /// corrupt. The caller is expected to rescan the segment and repopulate.
    pub fn load_or_reset(path: &Path) -> Result<(Self, bool)> {
        if !path.exists() {
            return Ok((Self::create(path)?, false));
        }
        match Self::load(path, true) {
            Ok(index) => Ok((index, false)),
            Err(e) => {
                warn!(index = %path.display(), error = %e, "Corrupt index, rebuilding from log");
                Ok((Self::create(path)?, true))
            }
        }
    }

    /// Append an entry and persist it.
    ///
    /// Out-of-order appends are rejected; the segment only ever indexes the
    /// record it just wrote.
    pub fn append(&mut self, relative_offset: u32, position: u32) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if relative_offset <= last.relative_offset || position <= last.position {
                return Err(VgError::Corrupt(format!(
                    "index {} append out of order: ({relative_offset}, {position}) after ({}, {})",
                    self.path.display(),
                    last.relative_offset,
                    last.position
                )));
            }
        }
        let entry = IndexEntry {
            relative_offset,
            position,
        };
        if let Some(file) = self.file.as_mut() {
            file.write_all(&entry.to_bytes())?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Find the entry with the greatest `relative_offset <= target`.
    ///
    /// Returns `None` when the target precedes the first entry; the caller
    /// reads from file position 0 in that case.
    pub fn lookup(&self, target: u32) -> Option<IndexEntry> {
        match self
            .entries
            .binary_search_by_key(&target, |e| e.relative_offset)
        {
            Ok(i) => Some(self.entries[i]),
            Err(0) => None,
            Err(i) => Some(self.entries[i - 1]),
        }
    }

    /// Last entry, if any
    pub fn last_entry(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// Drop all entries with `relative_offset >= from` and rewrite the file.
    pub fn truncate_from(&mut self, from: u32) -> Result<()> {
        let keep = self
            .entries
            .iter()
            .take_while(|e| e.relative_offset < from)
            .count();
        if keep == self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(keep);

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for entry in &self.entries {
            file.write_all(&entry.to_bytes())?;
        }
        self.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Derive the `.index` path for a `.log` path
pub fn index_path_for(log_path: &Path) -> PathBuf {
    log_path.with_extension("index")
}
