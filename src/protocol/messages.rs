//! Typed request and response messages for every operation vonnegut speaks
//!
//! The set is a Kafka-compatible subset (produce, fetch, metadata) plus the
//! vonnegut extension block (1000+): topics, fetch2, ensure, replicate, and
//! the two delete operations. Bodies are hand-framed with the primitives in
//! [`crate::protocol::codec`]; record sets reuse the storage frame format
//! byte-for-byte.

use crate::error::{ErrorCode, Result, VgError};
use crate::protocol::codec::{
    read_array_len, read_bytes32, read_i16, read_i32, read_i64, read_string, write_bytes32,
    write_string,
};
use crate::storage::record::{decode_records, encode_records, encoded_len, Record};
use bytes::{BufMut, BytesMut};

/// Operation codes. 0..=3 match the Kafka protocol; 1000 and up are the
/// vonnegut extension block. 1004/1005 are implementation-assigned (the
/// protocol reserves them but does not fix their values).
pub mod api_key {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const METADATA: i16 = 3;
    pub const TOPICS: i16 = 1000;
    pub const FETCH2: i16 = 1001;
    pub const ENSURE: i16 = 1002;
    pub const REPLICATE: i16 = 1003;
    pub const DELETE_TOPIC: i16 = 1004;
    pub const REPLICATE_DELETE_TOPIC: i16 = 1005;
}

// ---------------------------------------------------------------------------
// Produce

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceTopic {
    pub name: String,
    pub partitions: Vec<ProducePartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducePartition {
    pub partition: i32,
    pub records: Vec<Record>,
}

impl ProduceRequest {
    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let acks = read_i16(buf)?;
        let timeout_ms = read_i32(buf)?;
        let topic_count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_string(buf)?;
            let partition_count = read_array_len(buf)?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let partition = read_i32(buf)?;
                let record_set = read_bytes32(buf)?;
                partitions.push(ProducePartition {
                    partition,
                    records: decode_records(&record_set)?,
                });
            }
            topics.push(ProduceTopic { name, partitions });
        }
        Ok(Self {
            acks,
            timeout_ms,
            topics,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.acks);
        buf.put_i32(self.timeout_ms);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            write_string(buf, &topic.name);
            buf.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                buf.put_i32(p.partition);
                write_bytes32(buf, &encode_records(&p.records));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceResponseTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponseTopic {
    pub name: String,
    pub partitions: Vec<ProduceResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponsePartition {
    pub partition: i32,
    pub error: i16,
    /// Offset of the last record written; -1 on chain failure, 0 when the
    /// topic or partition is unknown
    pub offset: i64,
}

impl ProduceResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            write_string(buf, &topic.name);
            buf.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                buf.put_i32(p.partition);
                buf.put_i16(p.error);
                buf.put_i64(p.offset);
            }
        }
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let topic_count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_string(buf)?;
            let partition_count = read_array_len(buf)?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                partitions.push(ProduceResponsePartition {
                    partition: read_i32(buf)?,
                    error: read_i16(buf)?,
                    offset: read_i64(buf)?,
                });
            }
            topics.push(ProduceResponseTopic { name, partitions });
        }
        Ok(Self { topics })
    }
}

// ---------------------------------------------------------------------------
// Fetch / fetch2

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
    /// Record-count bound carried by fetch2 only; -1 means unbounded
    pub limit: i32,
}

impl FetchRequest {
    /// Decode a fetch body; `with_limit` selects the fetch2 layout, which
    /// appends a per-partition `limit: i32`.
    pub fn decode(buf: &mut BytesMut, with_limit: bool) -> Result<Self> {
        let replica_id = read_i32(buf)?;
        let max_wait_ms = read_i32(buf)?;
        let min_bytes = read_i32(buf)?;
        let topic_count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_string(buf)?;
            let partition_count = read_array_len(buf)?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let partition = read_i32(buf)?;
                let offset = read_i64(buf)?;
                let max_bytes = read_i32(buf)?;
                let limit = if with_limit { read_i32(buf)? } else { -1 };
                partitions.push(FetchPartition {
                    partition,
                    offset,
                    max_bytes,
                    limit,
                });
            }
            topics.push(FetchTopic { name, partitions });
        }
        Ok(Self {
            replica_id,
            max_wait_ms,
            min_bytes,
            topics,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, with_limit: bool) {
        buf.put_i32(self.replica_id);
        buf.put_i32(self.max_wait_ms);
        buf.put_i32(self.min_bytes);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            write_string(buf, &topic.name);
            buf.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                buf.put_i32(p.partition);
                buf.put_i64(p.offset);
                buf.put_i32(p.max_bytes);
                if with_limit {
                    buf.put_i32(p.limit);
                }
            }
        }
    }
}

/// Encode the topic-level header of a fetch response (the partition bodies
/// follow as interleaved inline headers and file ranges).
pub fn encode_fetch_topic_header(buf: &mut BytesMut, name: &str, partition_count: i32) {
    write_string(buf, name);
    buf.put_i32(partition_count);
}

/// Encode one partition's fetch header; the record set bytes (of length
/// `record_set_size`) follow, inline or as a zero-copy file range.
pub fn encode_fetch_partition_header(
    buf: &mut BytesMut,
    partition: i32,
    error: i16,
    high_water_mark: i64,
    record_set_size: i32,
) {
    buf.put_i32(partition);
    buf.put_i16(error);
    buf.put_i64(high_water_mark);
    buf.put_i32(record_set_size);
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub topics: Vec<FetchResponseTopic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponseTopic {
    pub name: String,
    pub partitions: Vec<FetchResponsePartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponsePartition {
    pub partition: i32,
    pub error: i16,
    pub high_water_mark: i64,
    /// Raw record frames, untrimmed; may start before the requested offset
    /// and may end with a partial frame when `max_bytes` cut one.
    pub records: Vec<Record>,
}

impl FetchResponse {
    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let topic_count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = read_string(buf)?;
            let partition_count = read_array_len(buf)?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let partition = read_i32(buf)?;
                let error = read_i16(buf)?;
                let high_water_mark = read_i64(buf)?;
                let record_set = read_bytes32(buf)?;
                partitions.push(FetchResponsePartition {
                    partition,
                    error,
                    high_water_mark,
                    records: decode_records(&record_set)?,
                });
            }
            topics.push(FetchResponseTopic { name, partitions });
        }
        Ok(Self { topics })
    }
}

// ---------------------------------------------------------------------------
// Metadata

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    /// Empty means every registered topic
    pub topics: Vec<String>,
}

impl MetadataRequest {
    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(count);
        for _ in 0..count {
            topics.push(read_string(buf)?);
        }
        Ok(Self { topics })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            write_string(buf, topic);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error: i16,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error: i16,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub brokers: Vec<Broker>,
    pub topics: Vec<TopicMetadata>,
}

impl MetadataResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.brokers.len() as i32);
        for broker in &self.brokers {
            buf.put_i32(broker.node_id);
            write_string(buf, &broker.host);
            buf.put_i32(broker.port);
        }
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            buf.put_i16(topic.error);
            write_string(buf, &topic.name);
            buf.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                buf.put_i16(p.error);
                buf.put_i32(p.partition);
                buf.put_i32(p.leader);
                buf.put_i32(p.replicas.len() as i32);
                for r in &p.replicas {
                    buf.put_i32(*r);
                }
                buf.put_i32(p.isr.len() as i32);
                for r in &p.isr {
                    buf.put_i32(*r);
                }
            }
        }
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let broker_count = read_array_len(buf)?;
        let mut brokers = Vec::with_capacity(broker_count);
        for _ in 0..broker_count {
            brokers.push(Broker {
                node_id: read_i32(buf)?,
                host: read_string(buf)?,
                port: read_i32(buf)?,
            });
        }
        let topic_count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let error = read_i16(buf)?;
            let name = read_string(buf)?;
            let partition_count = read_array_len(buf)?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let error = read_i16(buf)?;
                let partition = read_i32(buf)?;
                let leader = read_i32(buf)?;
                let replica_count = read_array_len(buf)?;
                let mut replicas = Vec::with_capacity(replica_count);
                for _ in 0..replica_count {
                    replicas.push(read_i32(buf)?);
                }
                let isr_count = read_array_len(buf)?;
                let mut isr = Vec::with_capacity(isr_count);
                for _ in 0..isr_count {
                    isr.push(read_i32(buf)?);
                }
                partitions.push(PartitionMetadata {
                    error,
                    partition,
                    leader,
                    replicas,
                    isr,
                });
            }
            topics.push(TopicMetadata {
                error,
                name,
                partitions,
            });
        }
        Ok(Self { brokers, topics })
    }
}

// ---------------------------------------------------------------------------
// Topics

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicsResponse {
    pub topics: Vec<String>,
}

impl TopicsResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            write_string(buf, topic);
        }
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let count = read_array_len(buf)?;
        let mut topics = Vec::with_capacity(count);
        for _ in 0..count {
            topics.push(read_string(buf)?);
        }
        Ok(Self { topics })
    }
}

// ---------------------------------------------------------------------------
// Ensure / delete_topic / replicate_delete_topic

/// Shared body for the single-topic management requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRequest {
    pub topic: String,
}

impl TopicRequest {
    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        Ok(Self {
            topic: read_string(buf)?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.topic);
    }
}

/// Shared error-code-only response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: i16,
}

impl ErrorResponse {
    pub fn ok() -> Self {
        Self {
            error: ErrorCode::None.as_i16(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.error);
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        Ok(Self {
            error: read_i16(buf)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Replicate

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateRequest {
    pub topic: String,
    pub partition: i32,
    /// First offset of the record set; must equal the replica's next offset
    pub expected_first_offset: i64,
    pub records: Vec<Record>,
}

impl ReplicateRequest {
    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let topic = read_string(buf)?;
        let partition = read_i32(buf)?;
        let expected_first_offset = read_i64(buf)?;
        let record_set = read_bytes32(buf)?;
        let records = decode_records(&record_set)?;
        // Replicated sets are never cut mid-frame; a short tail means the
        // upstream sent a malformed stream
        if encoded_len(&records) != record_set.len() {
            return Err(VgError::Protocol(
                "replicate record set ends mid-frame".to_string(),
            ));
        }
        Ok(Self {
            topic,
            partition,
            expected_first_offset,
            records,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.topic);
        buf.put_i32(self.partition);
        buf.put_i64(self.expected_first_offset);
        write_bytes32(buf, &encode_records(&self.records));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateResponse {
    pub partition: i32,
    pub error: i16,
    /// Last appended offset on success, the needed-from cursor on
    /// write_repair, -1 on failure
    pub offset: i64,
    /// Present only when `error == write_repair`: the records this replica
    /// holds past the upstream's expected offset (empty when the replica is
    /// behind and needs the stream restarted instead)
    pub records: Vec<Record>,
}

impl ReplicateResponse {
    pub fn appended(partition: i32, offset: i64) -> Self {
        Self {
            partition,
            error: ErrorCode::None.as_i16(),
            offset,
            records: Vec::new(),
        }
    }

    pub fn write_repair(partition: i32, offset: i64, records: Vec<Record>) -> Self {
        Self {
            partition,
            error: ErrorCode::WriteRepair.as_i16(),
            offset,
            records,
        }
    }

    pub fn failed(partition: i32, error: ErrorCode) -> Self {
        Self {
            partition,
            error: error.as_i16(),
            offset: -1,
            records: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.partition);
        buf.put_i16(self.error);
        buf.put_i64(self.offset);
        if self.error == ErrorCode::WriteRepair.as_i16() {
            write_bytes32(buf, &encode_records(&self.records));
        }
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        let partition = read_i32(buf)?;
        let error = read_i16(buf)?;
        let offset = read_i64(buf)?;
        let records = if error == ErrorCode::WriteRepair.as_i16() {
            decode_records(&read_bytes32(buf)?)?
        } else {
            Vec::new()
        };
        Ok(Self {
            partition,
            error,
            offset,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_records() -> Vec<Record> {
        vec![
            Record {
                offset: 100,
                attributes: 0,
                value: Bytes::from_static(b"first"),
            },
            Record {
                offset: 101,
                attributes: 1,
                value: Bytes::from_static(b"second"),
            },
        ]
    }

    #[test]
    fn test_produce_round_trip() {
        let request = ProduceRequest {
            acks: 1,
            timeout_ms: 5000,
            topics: vec![ProduceTopic {
                name: "t".to_string(),
                partitions: vec![ProducePartition {
                    partition: 0,
                    records: sample_records(),
                }],
            }],
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(ProduceRequest::decode(&mut buf).unwrap(), request);
        assert!(buf.is_empty());

        let response = ProduceResponse {
            topics: vec![ProduceResponseTopic {
                name: "t".to_string(),
                partitions: vec![ProduceResponsePartition {
                    partition: 0,
                    error: 0,
                    offset: 101,
                }],
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(ProduceResponse::decode(&mut buf).unwrap(), response);
    }

    #[test]
    fn test_fetch_round_trip_both_layouts() {
        let request = FetchRequest {
            replica_id: -1,
            max_wait_ms: 100,
            min_bytes: 1,
            topics: vec![FetchTopic {
                name: "t".to_string(),
                partitions: vec![FetchPartition {
                    partition: 0,
                    offset: 42,
                    max_bytes: 1 << 20,
                    limit: -1,
                }],
            }],
        };

        let mut buf = BytesMut::new();
        request.encode(&mut buf, false);
        assert_eq!(FetchRequest::decode(&mut buf, false).unwrap(), request);

        let mut fetch2 = request.clone();
        fetch2.topics[0].partitions[0].limit = 10;
        let mut buf = BytesMut::new();
        fetch2.encode(&mut buf, true);
        assert_eq!(FetchRequest::decode(&mut buf, true).unwrap(), fetch2);
    }

    #[test]
    fn test_fetch_response_matches_scatter_gather_layout() {
        // Assemble the response the way the connection handler does: topic
        // header, partition header, then the record set bytes
        let records = sample_records();
        let set = encode_records(&records);

        let mut wire = BytesMut::new();
        wire.put_i32(1);
        encode_fetch_topic_header(&mut wire, "t", 1);
        encode_fetch_partition_header(&mut wire, 0, 0, 101, set.len() as i32);
        wire.put_slice(&set);

        let decoded = FetchResponse::decode(&mut wire).unwrap();
        assert_eq!(decoded.topics.len(), 1);
        let p = &decoded.topics[0].partitions[0];
        assert_eq!(p.high_water_mark, 101);
        assert_eq!(p.records, records);
    }

    #[test]
    fn test_metadata_round_trip() {
        let request = MetadataRequest {
            topics: vec!["exists".to_string(), "missing".to_string()],
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(MetadataRequest::decode(&mut buf).unwrap(), request);

        let response = MetadataResponse {
            brokers: vec![
                Broker {
                    node_id: 0,
                    host: "head".to_string(),
                    port: 5555,
                },
                Broker {
                    node_id: 1,
                    host: "tail".to_string(),
                    port: 5556,
                },
            ],
            topics: vec![TopicMetadata {
                error: 0,
                name: "exists".to_string(),
                partitions: vec![PartitionMetadata {
                    error: 0,
                    partition: 0,
                    leader: 0,
                    replicas: vec![0, 1],
                    isr: vec![0, 1],
                }],
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(MetadataResponse::decode(&mut buf).unwrap(), response);
    }

    #[test]
    fn test_topics_and_topic_request_round_trip() {
        let response = TopicsResponse {
            topics: vec!["a".to_string(), "b".to_string()],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(TopicsResponse::decode(&mut buf).unwrap(), response);

        let request = TopicRequest {
            topic: "ensure-me".to_string(),
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(TopicRequest::decode(&mut buf).unwrap(), request);
    }

    #[test]
    fn test_replicate_round_trip() {
        let request = ReplicateRequest {
            topic: "t".to_string(),
            partition: 0,
            expected_first_offset: 100,
            records: sample_records(),
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(ReplicateRequest::decode(&mut buf).unwrap(), request);

        let ok = ReplicateResponse::appended(0, 101);
        let mut buf = BytesMut::new();
        ok.encode(&mut buf);
        assert_eq!(ReplicateResponse::decode(&mut buf).unwrap(), ok);

        // write_repair carries a record set; other errors do not
        let repair = ReplicateResponse::write_repair(0, 95, sample_records());
        let mut buf = BytesMut::new();
        repair.encode(&mut buf);
        assert_eq!(ReplicateResponse::decode(&mut buf).unwrap(), repair);

        let behind = ReplicateResponse::write_repair(0, 95, Vec::new());
        let mut buf = BytesMut::new();
        behind.encode(&mut buf);
        let decoded = ReplicateResponse::decode(&mut buf).unwrap();
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.offset, 95);

        let failed = ReplicateResponse::failed(0, ErrorCode::Timeout);
        let mut buf = BytesMut::new();
        failed.encode(&mut buf);
        let decoded = ReplicateResponse::decode(&mut buf).unwrap();
        assert_eq!(decoded.offset, -1);
        assert_eq!(decoded.error, ErrorCode::Timeout.as_i16());
    }
}
