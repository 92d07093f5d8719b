//! Topic registry: (topic, partition) -> partition log
//!
//! The registry owns topic lifecycle (lazy create, idempotent ensure,
//! delete) and the process-wide watermark table. It also answers
//! `get_chain` for metadata responses via the chain map snapshot it holds.

use crate::chain::map::{ChainEntry, ChainMap};
use crate::error::{Result, VgError};
use crate::storage::fd_cache::FdCache;
use crate::storage::log::{LogConfig, PartitionLog};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Process-wide cache of per-partition high-water marks.
///
/// Partition logs are the writers; everyone else reads.
#[derive(Debug, Default)]
pub struct WatermarkTable {
    marks: DashMap<(String, i32), i64>,
}

impl WatermarkTable {
    pub fn set(&self, topic: &str, partition: i32, high_water_mark: i64) {
        self.marks
            .insert((topic.to_string(), partition), high_water_mark);
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.marks
            .get(&(topic.to_string(), partition))
            .map(|v| *v)
    }

    pub fn remove(&self, topic: &str, partition: i32) {
        self.marks.remove(&(topic.to_string(), partition));
    }
}

/// A registered topic and its partition logs
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Arc<PartitionLog>>,
}

/// Registry of all topics hosted by this node
pub struct TopicRegistry {
    roots: Vec<PathBuf>,
    config: LogConfig,
    topics: DashMap<String, Arc<Topic>>,
    fd_cache: Arc<FdCache>,
    watermarks: Arc<WatermarkTable>,
    chain_map: Arc<ChainMap>,
}

impl TopicRegistry {
    /// Scan the log roots, recover every partition directory found, and
    /// clean up tombstones left by an interrupted delete.
    pub fn open(
        roots: Vec<PathBuf>,
        config: LogConfig,
        chain_map: Arc<ChainMap>,
    ) -> Result<Self> {
        let registry = Self {
            roots,
            config,
            topics: DashMap::new(),
            fd_cache: Arc::new(FdCache::default()),
            watermarks: Arc::new(WatermarkTable::default()),
            chain_map,
        };

        let mut found: BTreeMap<String, Vec<(i32, PathBuf)>> = BTreeMap::new();
        for root in &registry.roots {
            std::fs::create_dir_all(root)?;
            for entry in std::fs::read_dir(root)? {
                let path = entry?.path();
                if !path.is_dir() {
                    continue;
                }
                if path.extension().map(|e| e == "deleted").unwrap_or(false) {
                    warn!(dir = %path.display(), "Removing tombstone from interrupted delete");
                    std::fs::remove_dir_all(&path)?;
                    continue;
                }
                if let Some((topic, partition)) = parse_partition_dir(&path) {
                    found.entry(topic).or_default().push((partition, root.clone()));
                }
            }
        }

        for (topic, mut partitions) in found {
            partitions.sort();
            let logs = partitions
                .into_iter()
                .map(|(partition, root)| {
                    PartitionLog::open(
                        &topic,
                        partition,
                        &root,
                        registry.config.clone(),
                        registry.fd_cache.clone(),
                        registry.watermarks.clone(),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            registry.topics.insert(
                topic.clone(),
                Arc::new(Topic {
                    name: topic,
                    partitions: logs,
                }),
            );
        }

        info!(topics = registry.topics.len(), "Topic registry opened");
        Ok(registry)
    }

    /// Create a topic with `partitions` partition logs. Creating an
    /// existing topic is a no-op success.
    pub fn create(&self, topic: &str, partitions: i32) -> Result<()> {
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        let root = self.root_for(topic);
        let logs = (0..partitions.max(1))
            .map(|partition| {
                PartitionLog::open(
                    topic,
                    partition,
                    &root,
                    self.config.clone(),
                    self.fd_cache.clone(),
                    self.watermarks.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // A racing create may have won; entry() keeps the first
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                info!(topic = %topic, partitions = logs.len(), "Topic created");
                Arc::new(Topic {
                    name: topic.to_string(),
                    partitions: logs,
                })
            });
        Ok(())
    }

    /// Idempotent single-partition create
    pub fn ensure(&self, topic: &str) -> Result<()> {
        self.create(topic, 1)
    }

    /// Remove the topic and delete every partition log on disk
    pub fn delete(&self, topic: &str) -> Result<()> {
        let (_, removed) = self
            .topics
            .remove(topic)
            .ok_or_else(|| VgError::UnknownTopicOrPartition(topic.to_string(), -1))?;
        for log in &removed.partitions {
            log.delete()?;
        }
        info!(topic = %topic, "Topic deleted");
        Ok(())
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<Arc<PartitionLog>> {
        let entry = self.topics.get(topic)?;
        entry.partitions.get(partition as usize).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|t| t.partitions.len() as i32)
    }

    /// All registered topic names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The chain whose topic range covers `topic`, if any
    pub fn get_chain(&self, topic: &str) -> Option<ChainEntry> {
        self.chain_map.find(topic)
    }

    pub fn chain_map(&self) -> &Arc<ChainMap> {
        &self.chain_map
    }

    pub fn fd_cache(&self) -> &Arc<FdCache> {
        &self.fd_cache
    }

    pub fn watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.watermarks.get(topic, partition)
    }

    /// A partition lives entirely in one root, picked by topic hash
    fn root_for(&self, topic: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        let i = (hasher.finish() % self.roots.len() as u64) as usize;
        self.roots[i].clone()
    }
}

/// Parse `<topic>-<partition>` directory names; topic names may themselves
/// contain dashes, so the partition is the numeric suffix.
fn parse_partition_dir(path: &std::path::Path) -> Option<(String, i32)> {
    let name = path.file_name()?.to_str()?;
    let (topic, partition) = name.rsplit_once('-')?;
    if topic.is_empty() {
        return None;
    }
    Some((topic.to_string(), partition.parse().ok()?))
}
