//! Shared LRU cache of read file descriptors for segment files
//!
//! Fetch serving and repair reads open segment `.log` files read-only; the
//! same files are hit over and over, so descriptors are kept in a small
//! process-wide LRU. Entries are invalidated when a segment is truncated or
//! its partition deleted.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default number of cached descriptors
pub const DEFAULT_FD_CACHE_CAPACITY: usize = 64;

/// LRU cache of `Path -> File` read handles
#[derive(Debug)]
pub struct FdCache {
    entries: Mutex<VecDeque<(PathBuf, Arc<File>)>>,
    capacity: usize,
}

impl FdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Fetch the cached handle for `path`, opening and inserting on miss.
    pub fn get(&self, path: &Path) -> std::io::Result<Arc<File>> {
        let mut entries = self.entries.lock();
        if let Some(i) = entries.iter().position(|(p, _)| p == path) {
            let entry = entries.remove(i).unwrap();
            let file = entry.1.clone();
            entries.push_front(entry);
            return Ok(file);
        }
        drop(entries);

        let file = Arc::new(File::open(path)?);
        let mut entries = self.entries.lock();
        entries.push_front((path.to_path_buf(), file.clone()));
        while entries.len() > self.capacity {
            entries.pop_back();
        }
        Ok(file)
    }

    /// Drop any cached handle for `path`
    pub fn invalidate(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.retain(|(p, _)| p != path);
    }

    /// Drop all cached handles under a directory (partition delete)
    pub fn invalidate_dir(&self, dir: &Path) {
        let mut entries = self.entries.lock();
        entries.retain(|(p, _)| !p.starts_with(dir));
    }
}

impl Default for FdCache {
    fn default() -> Self {
        Self::new(DEFAULT_FD_CACHE_CAPACITY)
    }
}
