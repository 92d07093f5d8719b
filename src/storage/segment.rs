//! Segment file pair: one `.log` plus one sparse `.index`
//!
//! A segment covers a contiguous offset range of a partition. The `.log`
//! file is record frames concatenated in write order with no extra framing;
//! the `.index` file is the sparse offset index (see [`crate::storage::index`]).
//! Both files share a stem that encodes the segment's base offset,
//! zero-padded to 20 digits:
//!
//! ```text
//! 00000000000000000000.log
//! 00000000000000000000.index
//! ```
//!
//! The active segment accepts appends; all earlier segments are immutable.
//! Recovery scans forward from the last index entry, validating each frame
//! (offsets dense, lengths sane) and truncating the first torn frame left
//! by a crash.

use crate::error::{Result, VgError};
use crate::storage::index::{index_path_for, OffsetIndex};
use crate::storage::record::{decode_records, Record, FRAME_HEADER_SIZE, MAX_FRAME_BODY};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A byte range in a segment's `.log` file, servable without copying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub path: PathBuf,
    pub position: u64,
    pub bytes: u64,
}

/// `.log` file name for a base offset, zero-padded to a fixed width
pub fn segment_log_filename(base_offset: i64) -> String {
    format!("{:020}.log", base_offset)
}

/// Parse the base offset out of a segment file name
pub fn parse_base_offset(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

#[cfg(unix)]
fn pread_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, pos)
}

#[cfg(not(unix))]
fn pread_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut clone = file.try_clone()?;
    clone.seek(SeekFrom::Start(pos))?;
    clone.read(buf)
}

/// Positioned read of exactly `buf.len()` bytes
pub fn pread_exact_at(file: &File, buf: &mut [u8], mut pos: u64) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = pread_at(file, &mut buf[filled..], pos)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        filled += n;
        pos += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn pwrite_all_at(file: &File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(not(unix))]
fn pwrite_all_at(file: &File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut clone = file.try_clone()?;
    clone.seek(SeekFrom::Start(pos))?;
    clone.write_all(buf)
}

/// One segment of a partition log
#[derive(Debug)]
pub struct Segment {
    base_offset: i64,
    log_path: PathBuf,
    index: OffsetIndex,

    /// Write handle; present only while this is the active segment
    writer: Option<File>,

    /// Current `.log` size in bytes
    size: u64,

    /// Offset one past the last record in this segment
    next_offset: i64,

    /// Log growth since the last index entry
    bytes_since_index: u64,
}

impl Segment {
    /// Create a fresh active segment in `dir`
    pub fn create(dir: &Path, base_offset: i64) -> Result<Self> {
        let log_path = dir.join(segment_log_filename(base_offset));
        let writer = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&log_path)?;
        let index = OffsetIndex::create(&index_path_for(&log_path))?;

        debug!(segment = %log_path.display(), base_offset, "Segment created");

        Ok(Self {
            base_offset,
            log_path,
            index,
            writer: Some(writer),
            size: 0,
            next_offset: base_offset,
            bytes_since_index: 0,
        })
    }

    /// Open an existing segment.
    ///
    /// The scan starts at the last index entry (or byte 0 when the index is
    /// empty or was corrupt) and validates every frame to end of file. With
    /// `writable`, a torn trailing frame is truncated away and the write
    /// handle is kept open; without it a torn frame is an error, since
    /// sealed segments are immutable and must be intact.
    pub fn open(log_path: &Path, index_interval_bytes: u64, writable: bool) -> Result<Self> {
        let base_offset = parse_base_offset(log_path).ok_or_else(|| {
            VgError::Corrupt(format!("bad segment file name {}", log_path.display()))
        })?;

        let file = OpenOptions::new().read(true).write(writable).open(log_path)?;
        let eof = file.metadata()?.len();

        let (mut index, mut rescan) = OffsetIndex::load_or_reset(&index_path_for(log_path))?;

        // Validate the resume point the index claims; a lie means the whole
        // index is suspect.
        let (mut pos, mut expected) = match index.last_entry() {
            Some(entry) if !rescan => {
                let pos = entry.position as u64;
                let offset = base_offset + entry.relative_offset as i64;
                if pos + FRAME_HEADER_SIZE as u64 > eof
                    || frame_offset_at(&file, pos)? != Some(offset)
                {
                    warn!(
                        segment = %log_path.display(),
                        "Index resume point does not match log, rebuilding"
                    );
                    rescan = true;
                    (0, base_offset)
                } else {
                    (pos, offset)
                }
            }
            _ => (0, base_offset),
        };

        if rescan {
            index = OffsetIndex::create(&index_path_for(log_path))?;
        }

        // When resuming at an index entry, the first scanned frame is the
        // indexed record itself; it already reset the counter when written.
        let mut skip_counter = !rescan && pos > 0;
        let mut bytes_since_index = 0u64;
        let mut valid_end = pos;
        let mut torn = false;

        while pos + FRAME_HEADER_SIZE as u64 <= eof {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            pread_exact_at(&file, &mut header, pos)?;
            let offset = i64::from_be_bytes(header[0..8].try_into().unwrap());
            let length = i32::from_be_bytes(header[8..12].try_into().unwrap());

            if offset != expected || length < 1 || length as usize > MAX_FRAME_BODY {
                torn = true;
                break;
            }
            let frame_len = FRAME_HEADER_SIZE as u64 + length as u64;
            if pos + frame_len > eof {
                torn = true;
                break;
            }

            if skip_counter {
                skip_counter = false;
            } else {
                bytes_since_index += frame_len;
                if bytes_since_index >= index_interval_bytes {
                    index.append((offset - base_offset) as u32, pos as u32)?;
                    bytes_since_index = 0;
                }
            }

            pos += frame_len;
            valid_end = pos;
            expected += 1;
        }

        if valid_end < eof {
            if !writable {
                return Err(VgError::Corrupt(format!(
                    "sealed segment {} has a torn frame at byte {valid_end}",
                    log_path.display()
                )));
            }
            warn!(
                segment = %log_path.display(),
                valid_end,
                eof,
                "Truncating torn segment tail"
            );
            file.set_len(valid_end)?;
            if torn {
                index.truncate_from((expected - base_offset) as u32)?;
            }
        }

        debug!(
            segment = %log_path.display(),
            base_offset,
            next_offset = expected,
            size = valid_end,
            "Segment opened"
        );

        Ok(Self {
            base_offset,
            log_path: log_path.to_path_buf(),
            index,
            writer: writable.then_some(file),
            size: valid_end,
            next_offset: expected,
            bytes_since_index,
        })
    }

    /// Append pre-assigned records to the active segment.
    ///
    /// The caller (the partition log, under its write lock) guarantees the
    /// records are dense starting at `next_offset`. A failed write leaves
    /// an unknown suffix on disk, so the process aborts and recovery
    /// truncates it on restart.
    pub fn append(&mut self, records: &[Record], index_interval_bytes: u64) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .expect("append on a sealed segment");

        let mut buf = bytes::BytesMut::with_capacity(
            records.iter().map(|r| r.frame_len()).sum(),
        );
        for record in records {
            record.encode(&mut buf);
        }

        if let Err(e) = pwrite_all_at(writer, &buf, self.size) {
            tracing::error!(
                segment = %self.log_path.display(),
                error = %e,
                "Write to active segment failed, aborting"
            );
            std::process::abort();
        }

        let mut pos = self.size;
        for record in records {
            let frame_len = record.frame_len() as u64;
            self.bytes_since_index += frame_len;
            if self.bytes_since_index >= index_interval_bytes {
                self.index
                    .append((record.offset - self.base_offset) as u32, pos as u32)?;
                self.bytes_since_index = 0;
            }
            pos += frame_len;
        }

        self.size = pos;
        self.next_offset = records.last().map(|r| r.offset + 1).unwrap_or(self.next_offset);
        Ok(())
    }

    /// Drop the write handle; the segment becomes immutable
    pub fn seal(&mut self) {
        self.writer = None;
    }

    /// Resolve a fetch into a byte range of this segment's `.log`.
    ///
    /// The range starts at the position of the record at the greatest index
    /// entry at or below `start_offset` (byte 0 when the target precedes
    /// the first entry), so it may include a prefix of records below
    /// `start_offset`; the consumer trims those. `max_bytes <= 0` means
    /// unbounded; `limit >= 0` bounds the count of records at or past
    /// `start_offset`.
    pub fn resolve(
        &self,
        file: &File,
        start_offset: i64,
        max_bytes: i32,
        limit: i32,
    ) -> Result<Option<FileSlice>> {
        if self.size == 0 || start_offset >= self.next_offset {
            return Ok(None);
        }

        let target = start_offset.max(self.base_offset) - self.base_offset;
        let position = match self.index.lookup(target as u32) {
            Some(entry) => entry.position as u64,
            None => 0,
        };

        let mut end = if limit >= 0 {
            self.walk_limit(file, position, start_offset, limit as u64)?
        } else {
            self.size
        };

        if max_bytes > 0 {
            end = end.min(position + max_bytes as u64);
        }

        let bytes = end.saturating_sub(position);
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(FileSlice {
            path: self.log_path.clone(),
            position,
            bytes,
        }))
    }

    /// Walk frame headers from `position`, returning the end position after
    /// `limit` records with offsets at or past `start_offset`.
    fn walk_limit(
        &self,
        file: &File,
        mut position: u64,
        start_offset: i64,
        limit: u64,
    ) -> Result<u64> {
        let mut counted = 0u64;
        while position + FRAME_HEADER_SIZE as u64 <= self.size && counted < limit {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            pread_exact_at(file, &mut header, position)?;
            let offset = i64::from_be_bytes(header[0..8].try_into().unwrap());
            let length = i32::from_be_bytes(header[8..12].try_into().unwrap());
            if length < 1 {
                return Err(VgError::Corrupt(format!(
                    "segment {} frame at byte {position} has length {length}",
                    self.log_path.display()
                )));
            }
            position += FRAME_HEADER_SIZE as u64 + length as u64;
            if offset >= start_offset {
                counted += 1;
            }
        }
        Ok(position.min(self.size))
    }

    /// Read decoded records with offsets in `[from, to)` out of this segment
    pub fn read_records(&self, file: &File, from: i64, to: i64) -> Result<Vec<Record>> {
        let from = from.max(self.base_offset);
        let to = to.min(self.next_offset);
        if from >= to {
            return Ok(Vec::new());
        }

        let position = match self.index.lookup((from - self.base_offset) as u32) {
            Some(entry) => entry.position as u64,
            None => 0,
        };
        let mut data = vec![0u8; (self.size - position) as usize];
        pread_exact_at(file, &mut data, position)?;

        let mut records = decode_records(&data)?;
        records.retain(|r| r.offset >= from && r.offset < to);
        Ok(records)
    }

    /// Drop all records with offsets at or past `to_offset`.
    ///
    /// Requires the write handle (reopen sealed segments before truncating
    /// into them).
    pub fn truncate_to(&mut self, file_for_walk: &File, to_offset: i64) -> Result<()> {
        if to_offset >= self.next_offset {
            return Ok(());
        }
        if to_offset <= self.base_offset {
            let writer = self.writer.as_ref().expect("truncate on a sealed segment");
            writer.set_len(0)?;
            self.index.truncate_from(0)?;
            self.size = 0;
            self.next_offset = self.base_offset;
            self.bytes_since_index = 0;
            return Ok(());
        }

        // Find the byte position of the first record to drop
        let mut position = match self.index.lookup((to_offset - self.base_offset) as u32) {
            Some(entry) => entry.position as u64,
            None => 0,
        };
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            pread_exact_at(file_for_walk, &mut header, position)?;
            let offset = i64::from_be_bytes(header[0..8].try_into().unwrap());
            let length = i32::from_be_bytes(header[8..12].try_into().unwrap());
            if offset >= to_offset {
                break;
            }
            position += FRAME_HEADER_SIZE as u64 + length as u64;
        }

        let writer = self.writer.as_ref().expect("truncate on a sealed segment");
        writer.set_len(position)?;
        self.index
            .truncate_from((to_offset - self.base_offset) as u32)?;
        self.size = position;
        self.next_offset = to_offset;
        self.bytes_since_index = 0;
        Ok(())
    }

    /// Reopen the write handle on a sealed segment (used when repair
    /// truncates into it)
    pub fn reopen_writable(&mut self) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.log_path)?,
            );
        }
        Ok(())
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn record_count(&self) -> i64 {
        self.next_offset - self.base_offset
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }
}

/// Read the frame offset at `pos`, or `None` when the header is past EOF
fn frame_offset_at(file: &File, pos: u64) -> Result<Option<i64>> {
    let mut header = [0u8; 8];
    match pread_exact_at(file, &mut header, pos) {
        Ok(()) => Ok(Some(i64::from_be_bytes(header))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
