//! Partition log: the ordered set of segments for one (topic, partition)
//!
//! The partition log owns the append path, offset assignment, segment
//! rollover, offset-based fetch resolution, crash recovery, and the
//! replica-side half of write repair.
//!
//! # Locking
//!
//! Each partition is a single-writer domain: appends, truncation, and
//! rollover run under the write half of one `RwLock` protecting the segment
//! table and the active segment's descriptors. Fetches take the read half
//! just long enough to resolve a `(file, position, bytes)` range, then serve
//! it lock-free: closed segments are immutable and the active segment only
//! grows at its tail, so a resolved range stays valid for the lifetime of
//! the response. `next_offset` is additionally mirrored in an atomic so the
//! high-water mark can be read without any lock.

use crate::error::{Result, VgError};
use crate::storage::fd_cache::FdCache;
use crate::storage::record::Record;
use crate::storage::segment::{FileSlice, Segment};
use crate::storage::topics::WatermarkTable;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage knobs for a partition log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Roll the active segment once its `.log` reaches this size
    pub segment_bytes: u64,
    /// Emit a sparse index entry per this many bytes of log growth
    pub index_interval_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 512 * 1024 * 1024,
            index_interval_bytes: 4096,
        }
    }
}

/// Outcome of a replica-side append
#[derive(Debug)]
pub enum ReplicatedAppend {
    /// Offsets matched; records are durable. Carries the last offset.
    Appended(i64),
    /// This replica is ahead of the upstream; carries the records the
    /// upstream is missing, starting at the expected offset it sent.
    Ahead(Vec<Record>),
    /// This replica is behind the upstream; carries the offset it needs
    /// the stream to restart from.
    Behind { needed_from: i64 },
}

/// A resolved fetch: byte range (if any) plus the high-water mark as of
/// call entry
#[derive(Debug)]
pub struct FetchRange {
    pub slice: Option<FileSlice>,
    pub high_water_mark: i64,
}

/// The per-partition storage engine
pub struct PartitionLog {
    topic: String,
    partition: i32,
    dir: PathBuf,
    config: LogConfig,

    /// Next offset to assign; mirrors the active segment's tail
    next_offset: AtomicI64,

    /// Segments sorted by base offset; the last one is active
    segments: RwLock<Vec<Segment>>,

    fd_cache: Arc<FdCache>,
    watermarks: Arc<WatermarkTable>,
}

impl PartitionLog {
    /// Open (or create) the partition directory and recover its segments.
    ///
    /// Segments are sorted by base offset; all but the highest are opened
    /// immutable, the highest is scanned forward from its last index entry
    /// and any torn tail is truncated away.
    pub fn open(
        topic: &str,
        partition: i32,
        root: &Path,
        config: LogConfig,
        fd_cache: Arc<FdCache>,
        watermarks: Arc<WatermarkTable>,
    ) -> Result<Arc<Self>> {
        let dir = root.join(format!("{topic}-{partition}"));
        create_partition_dir(&dir)?;

        let mut log_files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "log").unwrap_or(false))
            .collect();
        log_files.sort();

        let mut segments = Vec::with_capacity(log_files.len().max(1));
        let count = log_files.len();
        for (i, path) in log_files.into_iter().enumerate() {
            let writable = i == count - 1;
            let segment = Segment::open(&path, config.index_interval_bytes, writable)?;
            if let Some(prev) = segments.last() {
                let prev: &Segment = prev;
                if segment.base_offset() != prev.next_offset() {
                    return Err(VgError::Corrupt(format!(
                        "{}: segment {} does not continue from {} (next {})",
                        dir.display(),
                        segment.base_offset(),
                        prev.base_offset(),
                        prev.next_offset()
                    )));
                }
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            segments.push(Segment::create(&dir, 0)?);
        }

        let next_offset = segments.last().unwrap().next_offset();
        watermarks.set(topic, partition, next_offset - 1);

        info!(
            topic = %topic,
            partition,
            segments = segments.len(),
            next_offset,
            "Partition log opened"
        );

        Ok(Arc::new(Self {
            topic: topic.to_string(),
            partition,
            dir,
            config,
            next_offset: AtomicI64::new(next_offset),
            segments: RwLock::new(segments),
            fd_cache,
            watermarks,
        }))
    }

    /// Append records, assigning them the next dense offsets.
    ///
    /// Returns the offset of the last record written.
    pub fn append(&self, records: &mut [Record]) -> Result<i64> {
        if records.is_empty() {
            return Ok(self.high_water_mark());
        }
        let mut segments = self.segments.write();

        let first = self.next_offset.load(Ordering::Acquire);
        for (i, record) in records.iter_mut().enumerate() {
            record.offset = first + i as i64;
        }
        self.append_locked(&mut segments, records)?;
        Ok(first + records.len() as i64 - 1)
    }

    /// Append records that already carry dense offsets starting at this
    /// log's `next_offset` (the replica path and repair backfill).
    pub fn append_assigned(&self, records: &[Record]) -> Result<i64> {
        if records.is_empty() {
            return Ok(self.high_water_mark());
        }
        let mut segments = self.segments.write();
        let next = self.next_offset.load(Ordering::Acquire);
        if records[0].offset != next {
            return Err(VgError::Corrupt(format!(
                "{}-{}: assigned append at {} but next offset is {next}",
                self.topic, self.partition, records[0].offset
            )));
        }
        self.append_locked(&mut segments, records)?;
        Ok(records.last().unwrap().offset)
    }

    /// Write pre-assigned records to the active segment and roll it when it
    /// crosses the size threshold. Caller holds the write lock.
    fn append_locked(&self, segments: &mut Vec<Segment>, records: &[Record]) -> Result<()> {
        for pair in records.windows(2) {
            if pair[1].offset != pair[0].offset + 1 {
                return Err(VgError::Corrupt(format!(
                    "{}-{}: batch offsets not dense at {}",
                    self.topic, self.partition, pair[1].offset
                )));
            }
        }

        let active = segments.last_mut().expect("segment list never empty");
        active.append(records, self.config.index_interval_bytes)?;

        let next = active.next_offset();
        let roll = active.size() >= self.config.segment_bytes;
        if roll {
            // The new segment's files are ready before the list is updated,
            // so concurrent readers never observe a half-open segment.
            let fresh = Segment::create(&self.dir, next)?;
            segments.last_mut().unwrap().seal();
            segments.push(fresh);
            debug!(
                topic = %self.topic,
                partition = self.partition,
                base_offset = next,
                "Segment rolled"
            );
        }

        self.next_offset.store(next, Ordering::Release);
        self.watermarks.set(&self.topic, self.partition, next - 1);
        Ok(())
    }

    /// Replica-side append: compare the upstream's expected offset against
    /// ours and either append, hand back the records it is missing, or ask
    /// it to restart the stream earlier.
    pub fn replicated_append(
        &self,
        expected_first: i64,
        records: &[Record],
    ) -> Result<ReplicatedAppend> {
        let next = self.next_offset.load(Ordering::Acquire);
        if expected_first == next {
            let last = self.append_assigned(records)?;
            return Ok(ReplicatedAppend::Appended(last));
        }
        if expected_first < next {
            let missing = self.read_records(expected_first, next)?;
            warn!(
                topic = %self.topic,
                partition = self.partition,
                expected_first,
                next_offset = next,
                "Replica ahead of upstream, returning write repair records"
            );
            return Ok(ReplicatedAppend::Ahead(missing));
        }
        warn!(
            topic = %self.topic,
            partition = self.partition,
            expected_first,
            next_offset = next,
            "Replica behind upstream, requesting restart"
        );
        Ok(ReplicatedAppend::Behind { needed_from: next })
    }

    /// Resolve a fetch at `start_offset` into a byte range of one segment.
    ///
    /// The range begins at the record named by the greatest index entry at
    /// or below the target, so it may carry a prefix of earlier records;
    /// the consumer trims those. An offset past the high-water mark (or an
    /// empty log) resolves to no range. An offset below the earliest
    /// retained record is served from the earliest retained record.
    pub fn fetch(&self, start_offset: i64, max_bytes: i32, limit: i32) -> Result<FetchRange> {
        let segments = self.segments.read();
        let high_water_mark = self.next_offset.load(Ordering::Acquire) - 1;

        if start_offset > high_water_mark || high_water_mark < 0 {
            return Ok(FetchRange {
                slice: None,
                high_water_mark,
            });
        }

        let segment = select_segment(&segments, start_offset);
        let file = self.fd_cache.get(segment.log_path())?;
        let slice = segment.resolve(&file, start_offset, max_bytes, limit)?;
        Ok(FetchRange {
            slice,
            high_water_mark,
        })
    }

    /// Read decoded records with offsets in `[from, to)`, crossing segment
    /// boundaries as needed (repair backfill path).
    pub fn read_records(&self, from: i64, to: i64) -> Result<Vec<Record>> {
        let segments = self.segments.read();
        let mut out = Vec::new();
        for segment in segments.iter() {
            if segment.next_offset() <= from || segment.base_offset() >= to {
                continue;
            }
            let file = self.fd_cache.get(segment.log_path())?;
            out.extend(segment.read_records(&file, from, to)?);
        }
        Ok(out)
    }

    /// Drop every record at or past `to_offset` (upstream half of
    /// ahead-repair). The segment holding the cut becomes active again.
    pub fn truncate(&self, to_offset: i64) -> Result<()> {
        let mut segments = self.segments.write();
        let next = self.next_offset.load(Ordering::Acquire);
        if to_offset >= next {
            return Ok(());
        }

        // Whole segments past the cut are deleted outright
        while segments.len() > 1 && segments.last().unwrap().base_offset() >= to_offset {
            let segment = segments.pop().unwrap();
            self.fd_cache.invalidate(segment.log_path());
            remove_segment_files(&segment)?;
        }

        let last = segments.last_mut().expect("segment list never empty");
        last.reopen_writable()?;
        self.fd_cache.invalidate(last.log_path());
        let walk = std::fs::File::open(last.log_path())?;
        last.truncate_to(&walk, to_offset)?;

        self.next_offset.store(to_offset, Ordering::Release);
        self.watermarks.set(&self.topic, self.partition, to_offset - 1);
        info!(
            topic = %self.topic,
            partition = self.partition,
            to_offset,
            "Partition log truncated"
        );
        Ok(())
    }

    /// Close all descriptors and remove the partition directory: rename to
    /// a tombstone first so a crash mid-delete never leaves a live-looking
    /// directory behind, then unlink the tombstone.
    pub fn delete(&self) -> Result<()> {
        let mut segments = self.segments.write();
        segments.clear();
        self.fd_cache.invalidate_dir(&self.dir);
        self.watermarks.remove(&self.topic, self.partition);

        let tombstone = self.dir.with_extension("deleted");
        if tombstone.exists() {
            fs::remove_dir_all(&tombstone)?;
        }
        fs::rename(&self.dir, &tombstone)?;
        fs::remove_dir_all(&tombstone)?;

        info!(topic = %self.topic, partition = self.partition, "Partition log deleted");
        Ok(())
    }

    pub fn high_water_mark(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire) - 1
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Pick the segment with the greatest base offset at or below
/// `start_offset`, clamping to the earliest segment for targets below it.
fn select_segment(segments: &[Segment], start_offset: i64) -> &Segment {
    match segments.binary_search_by_key(&start_offset, |s| s.base_offset()) {
        Ok(i) => &segments[i],
        Err(0) => &segments[0],
        Err(i) => &segments[i - 1],
    }
}

#[cfg(unix)]
fn create_partition_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !dir.exists() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_partition_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

fn remove_segment_files(segment: &Segment) -> Result<()> {
    use crate::storage::index::index_path_for;
    fs::remove_file(segment.log_path())?;
    let index = index_path_for(segment.log_path());
    if index.exists() {
        fs::remove_file(index)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::decode_records;
    use crate::storage::segment::pread_exact_at;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn open_log(root: &Path, config: LogConfig) -> Arc<PartitionLog> {
        PartitionLog::open(
            "t",
            0,
            root,
            config,
            Arc::new(FdCache::default()),
            Arc::new(WatermarkTable::default()),
        )
        .unwrap()
    }

    fn payloads(count: usize, payload: &str) -> Vec<Record> {
        (0..count)
            .map(|_| Record::new(Bytes::copy_from_slice(payload.as_bytes())))
            .collect()
    }

    fn fetch_records(log: &PartitionLog, offset: i64) -> (Vec<Record>, i64) {
        let range = log.fetch(offset, 0, -1).unwrap();
        let records = match range.slice {
            Some(slice) => {
                let file = std::fs::File::open(&slice.path).unwrap();
                let mut data = vec![0u8; slice.bytes as usize];
                pread_exact_at(&file, &mut data, slice.position).unwrap();
                decode_records(&data)
                    .unwrap()
                    .into_iter()
                    .filter(|r| r.offset >= offset)
                    .collect()
            }
            None => Vec::new(),
        };
        (records, range.high_water_mark)
    }

    #[test]
    fn test_append_assigns_dense_offsets() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), LogConfig::default());

        assert_eq!(log.high_water_mark(), -1);
        let mut batch = payloads(3, "a");
        let last = log.append(&mut batch).unwrap();
        assert_eq!(last, 2);
        assert_eq!(batch[0].offset, 0);
        assert_eq!(batch[2].offset, 2);

        let mut batch = payloads(2, "b");
        assert_eq!(log.append(&mut batch).unwrap(), 4);
        assert_eq!(log.high_water_mark(), 4);
    }

    #[test]
    fn test_index_interior_lookup_pin() {
        let dir = tempdir().unwrap();
        // 28-byte frames; an index entry roughly every 10 records
        let log = open_log(
            dir.path(),
            LogConfig {
                segment_bytes: 512 * 1024 * 1024,
                index_interval_bytes: 280,
            },
        );

        let mut batch = payloads(100, "123456789abcdef");
        log.append(&mut batch).unwrap();

        let (all, hwm) = fetch_records(&log, 0);
        assert_eq!(all.len(), 100);
        assert_eq!(hwm, 99);

        let (from_ten, hwm) = fetch_records(&log, 10);
        assert_eq!(from_ten.len(), 90);
        assert_eq!(hwm, 99);
        assert_eq!(from_ten[0].offset, 10);

        let mut batch = payloads(100, "123456789abcdef");
        log.append(&mut batch).unwrap();

        let (all, hwm) = fetch_records(&log, 0);
        assert_eq!(all.len(), 200);
        assert_eq!(hwm, 199);

        let (from_ten, hwm) = fetch_records(&log, 10);
        assert_eq!(from_ten.len(), 190);
        assert_eq!(hwm, 199);
    }

    #[test]
    fn test_fetch_past_high_water_mark_is_empty() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), LogConfig::default());
        let mut batch = payloads(5, "x");
        log.append(&mut batch).unwrap();

        let (records, hwm) = fetch_records(&log, 5);
        assert_eq!(hwm, 4);
        assert!(records.is_empty());

        let (records, _) = fetch_records(&log, 100);
        assert!(records.is_empty());
    }

    #[test]
    fn test_rollover_keeps_offsets_dense() {
        let dir = tempdir().unwrap();
        let log = open_log(
            dir.path(),
            LogConfig {
                segment_bytes: 100,
                index_interval_bytes: 64,
            },
        );

        // Each batch exceeds segment_bytes; the append succeeds and the
        // rollover happens after it
        for _ in 0..4 {
            let mut batch = payloads(5, "0123456789abcdefghij");
            log.append(&mut batch).unwrap();
        }
        assert_eq!(log.high_water_mark(), 19);

        let segment_count = std::fs::read_dir(log.dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map(|x| x == "log")
                    .unwrap_or(false)
            })
            .count();
        assert!(segment_count >= 4);

        // Reads across the segment boundary stay dense
        let (records, _) = fetch_records(&log, 3);
        assert_eq!(records.first().unwrap().offset, 3);
        for pair in records.windows(2) {
            assert_eq!(pair[1].offset, pair[0].offset + 1);
        }
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path(), LogConfig::default());
            let mut batch = payloads(25, "persistent");
            log.append(&mut batch).unwrap();
        }
        let log = open_log(dir.path(), LogConfig::default());
        assert_eq!(log.high_water_mark(), 24);
        let mut batch = payloads(1, "more");
        assert_eq!(log.append(&mut batch).unwrap(), 25);
    }

    #[test]
    fn test_replicated_append_matrix() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), LogConfig::default());

        let mut seed = payloads(10, "seed");
        log.append(&mut seed).unwrap();

        // Matching expected offset: appended
        let mut batch = payloads(3, "next");
        for (i, r) in batch.iter_mut().enumerate() {
            r.offset = 10 + i as i64;
        }
        match log.replicated_append(10, &batch).unwrap() {
            ReplicatedAppend::Appended(last) => assert_eq!(last, 12),
            other => panic!("expected Appended, got {other:?}"),
        }

        // Upstream behind us: we hand back what it is missing
        let mut stale = payloads(2, "stale");
        for (i, r) in stale.iter_mut().enumerate() {
            r.offset = 8 + i as i64;
        }
        match log.replicated_append(8, &stale).unwrap() {
            ReplicatedAppend::Ahead(missing) => {
                assert_eq!(missing.len(), 5);
                assert_eq!(missing[0].offset, 8);
                assert_eq!(missing.last().unwrap().offset, 12);
                assert_eq!(missing[0].value, Bytes::from_static(b"seed"));
            }
            other => panic!("expected Ahead, got {other:?}"),
        }

        // Upstream ahead of us: ask it to restart from our tail
        let mut future = payloads(1, "future");
        future[0].offset = 20;
        match log.replicated_append(20, &future).unwrap() {
            ReplicatedAppend::Behind { needed_from } => assert_eq!(needed_from, 13),
            other => panic!("expected Behind, got {other:?}"),
        }
    }

    #[test]
    fn test_truncate_across_segments() {
        let dir = tempdir().unwrap();
        let log = open_log(
            dir.path(),
            LogConfig {
                segment_bytes: 200,
                index_interval_bytes: 64,
            },
        );
        for _ in 0..10 {
            let mut batch = payloads(4, "0123456789");
            log.append(&mut batch).unwrap();
        }
        assert_eq!(log.high_water_mark(), 39);

        log.truncate(17).unwrap();
        assert_eq!(log.high_water_mark(), 16);
        assert_eq!(log.next_offset(), 17);

        // Appends continue densely from the cut
        let mut batch = payloads(3, "fresh");
        assert_eq!(log.append(&mut batch).unwrap(), 19);
        let (records, _) = fetch_records(&log, 15);
        assert_eq!(records.len(), 5);
        assert_eq!(records[2].value, Bytes::from_static(b"fresh"));
    }

    #[test]
    fn test_read_records_spans_segments() {
        let dir = tempdir().unwrap();
        let log = open_log(
            dir.path(),
            LogConfig {
                segment_bytes: 150,
                index_interval_bytes: 64,
            },
        );
        for _ in 0..6 {
            let mut batch = payloads(3, "0123456789");
            log.append(&mut batch).unwrap();
        }

        let records = log.read_records(4, 15).unwrap();
        assert_eq!(records.len(), 11);
        assert_eq!(records[0].offset, 4);
        assert_eq!(records.last().unwrap().offset, 14);
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), LogConfig::default());
        let mut batch = payloads(5, "bye");
        log.append(&mut batch).unwrap();

        let partition_dir = log.dir().to_path_buf();
        assert!(partition_dir.exists());
        log.delete().unwrap();
        assert!(!partition_dir.exists());
        assert!(!partition_dir.with_extension("deleted").exists());
    }
}
