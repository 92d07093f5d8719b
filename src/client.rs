//! Bundled client
//!
//! A thin, framed client for driving a vonnegut deployment: produce to the
//! head, fetch from the tail, probe metadata, and manage topics. Also used
//! by the integration tests.
//!
//! The client owns the consumer-side half of the sparse-index fetch
//! contract: a fetch response may begin with records below the requested
//! offset (the server serves from the nearest index entry at or before the
//! target) and may end with a frame cut by `max_bytes`; both are trimmed
//! here before records are handed to the caller.

use crate::error::{Result, VgError};
use crate::protocol::codec::{frame_request, RequestHeader};
use crate::protocol::messages::{
    api_key, ErrorResponse, FetchPartition, FetchRequest, FetchTopic, MetadataRequest,
    MetadataResponse, ProducePartition, ProduceRequest, ProduceTopic, TopicRequest,
    TopicsResponse,
};
use crate::storage::record::Record;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Result of a fetch for one partition, after consumer-side trimming
#[derive(Debug)]
pub struct FetchResult {
    pub error: i16,
    pub high_water_mark: i64,
    pub records: Vec<Record>,
}

/// Result of a produce for one partition
#[derive(Debug)]
pub struct ProduceResult {
    pub error: i16,
    /// Offset of the last record written (-1 on chain failure)
    pub offset: i64,
}

pub struct VgClient {
    stream: TcpStream,
    correlation: i32,
    client_id: String,
}

impl VgClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            correlation: 0,
            client_id: "vg-client".to_string(),
        })
    }

    /// Publish payloads to one partition; offsets are assigned by the head
    pub async fn produce(
        &mut self,
        topic: &str,
        partition: i32,
        payloads: Vec<Bytes>,
    ) -> Result<ProduceResult> {
        let request = ProduceRequest {
            acks: -1,
            timeout_ms: 5000,
            topics: vec![ProduceTopic {
                name: topic.to_string(),
                partitions: vec![ProducePartition {
                    partition,
                    records: payloads.into_iter().map(Record::new).collect(),
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let mut response = self.request(api_key::PRODUCE, &body).await?;

        let decoded = crate::protocol::messages::ProduceResponse::decode(&mut response)?;
        let p = decoded
            .topics
            .first()
            .and_then(|t| t.partitions.first())
            .ok_or_else(|| VgError::Protocol("empty produce response".to_string()))?;
        Ok(ProduceResult {
            error: p.error,
            offset: p.offset,
        })
    }

    /// Fetch from `offset` with no record bound
    pub async fn fetch(&mut self, topic: &str, partition: i32, offset: i64) -> Result<FetchResult> {
        self.fetch_inner(topic, partition, offset, 0, -1, false).await
    }

    /// Fetch with an explicit record-count bound (`limit = -1` for none)
    pub async fn fetch2(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        limit: i32,
    ) -> Result<FetchResult> {
        self.fetch_inner(topic, partition, offset, max_bytes, limit, true)
            .await
    }

    async fn fetch_inner(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        limit: i32,
        fetch2: bool,
    ) -> Result<FetchResult> {
        let request = FetchRequest {
            replica_id: -1,
            max_wait_ms: 0,
            min_bytes: 0,
            topics: vec![FetchTopic {
                name: topic.to_string(),
                partitions: vec![FetchPartition {
                    partition,
                    offset,
                    max_bytes,
                    limit,
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, fetch2);
        let key = if fetch2 { api_key::FETCH2 } else { api_key::FETCH };
        let mut response = self.request(key, &body).await?;

        let decoded = crate::protocol::messages::FetchResponse::decode(&mut response)?;
        let p = decoded
            .topics
            .into_iter()
            .next()
            .and_then(|t| t.partitions.into_iter().next())
            .ok_or_else(|| VgError::Protocol("empty fetch response".to_string()))?;

        // Trim the sparse-index prefix: the server sends from the nearest
        // index entry at or before the target
        let mut records = p.records;
        records.retain(|r| r.offset >= offset);
        Ok(FetchResult {
            error: p.error,
            high_water_mark: p.high_water_mark,
            records,
        })
    }

    /// Metadata probe; topics that do not exist are omitted from the reply
    pub async fn metadata(&mut self, topics: &[&str]) -> Result<MetadataResponse> {
        let request = MetadataRequest {
            topics: topics.iter().map(|t| t.to_string()).collect(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let mut response = self.request(api_key::METADATA, &body).await?;
        MetadataResponse::decode(&mut response)
    }

    /// All topic names registered on the server
    pub async fn topics(&mut self) -> Result<Vec<String>> {
        let mut response = self.request(api_key::TOPICS, &[]).await?;
        Ok(TopicsResponse::decode(&mut response)?.topics)
    }

    /// Idempotent topic creation
    pub async fn ensure_topic(&mut self, topic: &str) -> Result<i16> {
        self.topic_op(api_key::ENSURE, topic).await
    }

    /// Delete a topic across its chain
    pub async fn delete_topic(&mut self, topic: &str) -> Result<i16> {
        self.topic_op(api_key::DELETE_TOPIC, topic).await
    }

    async fn topic_op(&mut self, key: i16, topic: &str) -> Result<i16> {
        let request = TopicRequest {
            topic: topic.to_string(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let mut response = self.request(key, &body).await?;
        Ok(ErrorResponse::decode(&mut response)?.error)
    }

    /// One framed round trip; replies arrive in request order
    async fn request(&mut self, api_key: i16, body: &[u8]) -> Result<BytesMut> {
        self.correlation += 1;
        let correlation_id = self.correlation;
        let header = RequestHeader {
            api_key,
            api_version: 0,
            correlation_id,
            client_id: Some(self.client_id.clone()),
        };
        let frame = frame_request(&header, body);
        self.stream.write_all(&frame).await?;

        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length).await?;
        let length = i32::from_be_bytes(length);
        if length < 4 {
            return Err(VgError::Protocol(format!("response frame length {length}")));
        }
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;

        let mut payload = BytesMut::from(&payload[..]);
        let got = payload.get_i32();
        if got != correlation_id {
            return Err(VgError::Protocol(format!(
                "correlation {got} does not match request {correlation_id}"
            )));
        }
        Ok(payload)
    }
}
