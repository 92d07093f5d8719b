//! Storage engine for vonnegut
//!
//! The segmented on-disk log for a partition: record frames, the sparse
//! offset index, segment file pairs, the per-partition log with append /
//! fetch / recovery / repair, the topic registry, and the shared descriptor
//! cache for read paths.

pub mod fd_cache;
pub mod index;
pub mod log;
pub mod record;
pub mod segment;
pub mod topics;

pub use fd_cache::FdCache;
pub use index::{IndexEntry, OffsetIndex};
pub use log::{FetchRange, LogConfig, PartitionLog, ReplicatedAppend};
pub use record::{decode_records, encode_records, Compression, Record};
pub use segment::{FileSlice, Segment};
pub use topics::{Topic, TopicRegistry, WatermarkTable};
