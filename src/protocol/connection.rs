//! Per-connection handler: frame, dispatch by (opcode, role), reply
//!
//! Each accepted socket gets one handler with the node's role fixed at
//! accept time (there is no unassigned window: a connection that exists has
//! a role). Incoming bytes accumulate in a buffer; as many complete
//! length-prefixed frames as are present get dispatched in order, and
//! trailing partial bytes stay buffered verbatim. Replies go out in strict
//! request order on the socket.
//!
//! Protocol errors before a correlation id is known (bad framing, torn
//! header) drop the connection; after that, the reply carries a specific
//! error code instead.

use crate::chain::role::Role;
use crate::chain::supervisor::ChainSupervisor;
use crate::error::{ErrorCode, Result, VgError};
use crate::protocol::codec::{extract_frame, frame_response, RequestHeader};
use crate::protocol::messages::{
    api_key, encode_fetch_partition_header, encode_fetch_topic_header, Broker, ErrorResponse,
    FetchRequest, MetadataRequest, MetadataResponse, PartitionMetadata, ProduceRequest,
    ProduceResponse, ProduceResponsePartition, ProduceResponseTopic, ReplicateRequest,
    TopicMetadata, TopicRequest, TopicsResponse,
};
use crate::protocol::response::{write_segments, ResponseSegment};
use crate::storage::segment::FileSlice;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Receive buffer sizing; matches the listener's socket buffer
const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct ConnectionHandler {
    supervisor: Arc<ChainSupervisor>,
    role: Role,
}

impl ConnectionHandler {
    pub fn new(supervisor: Arc<ChainSupervisor>, role: Role) -> Self {
        Self { supervisor, role }
    }

    /// Run the connection until the peer closes or a protocol error ends it
    pub async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr().ok();
        debug!(peer = ?peer, role = %self.role, "Connection accepted");

        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                if !buffer.is_empty() {
                    warn!(peer = ?peer, buffered = buffer.len(), "Peer closed mid-frame");
                }
                debug!(peer = ?peer, "Connection closed");
                return Ok(());
            }

            while let Some(mut frame) = extract_frame(&mut buffer)? {
                let header = RequestHeader::parse(&mut frame)?;
                // Once the correlation id is known, a malformed body gets a
                // coded reply instead of a dropped connection
                let segments = match self.dispatch(&header, frame).await {
                    Ok(segments) => segments,
                    Err(e @ (VgError::Protocol(_) | VgError::Corrupt(_))) => {
                        warn!(peer = ?peer, correlation_id = header.correlation_id, error = %e, "Malformed request body");
                        error_reply(header.correlation_id, ErrorCode::Unknown)
                    }
                    Err(e) => return Err(e),
                };
                write_segments(
                    &mut stream,
                    &segments,
                    self.supervisor.registry().fd_cache(),
                )
                .await?;
            }
        }
    }

    /// Route one request. `Err` tears the connection down; recoverable
    /// problems become error codes inside a normal reply.
    async fn dispatch(
        &self,
        header: &RequestHeader,
        mut body: BytesMut,
    ) -> Result<Vec<ResponseSegment>> {
        if let Err(code) = self.role.accepts(header.api_key) {
            return self.reject(header, body, code);
        }

        match header.api_key {
            api_key::PRODUCE => self.handle_produce(header, &mut body).await,
            api_key::FETCH => self.handle_fetch(header, &mut body, false),
            api_key::FETCH2 => self.handle_fetch(header, &mut body, true),
            api_key::METADATA => self.handle_metadata(header, &mut body),
            api_key::TOPICS => {
                let response = TopicsResponse {
                    topics: self.supervisor.registry().list(),
                };
                let mut out = BytesMut::new();
                response.encode(&mut out);
                Ok(inline(header.correlation_id, &out))
            }
            api_key::ENSURE => {
                let request = TopicRequest::decode(&mut body)?;
                let error = match self.supervisor.registry().ensure(&request.topic) {
                    Ok(()) => ErrorCode::None,
                    Err(e) => {
                        warn!(topic = %request.topic, error = %e, "Ensure failed");
                        e.code()
                    }
                };
                Ok(error_reply(header.correlation_id, error))
            }
            api_key::DELETE_TOPIC => {
                let request = TopicRequest::decode(&mut body)?;
                let error = match self.supervisor.delete_topic(&request.topic).await {
                    Ok(()) => ErrorCode::None,
                    Err(e) => e.code(),
                };
                Ok(error_reply(header.correlation_id, error))
            }
            api_key::REPLICATE => {
                let request = ReplicateRequest::decode(&mut body)?;
                let response = self.supervisor.handle_replicate(request).await;
                let mut out = BytesMut::new();
                response.encode(&mut out);
                Ok(inline(header.correlation_id, &out))
            }
            api_key::REPLICATE_DELETE_TOPIC => {
                let request = TopicRequest::decode(&mut body)?;
                let error = match self.supervisor.handle_replicate_delete(&request.topic).await {
                    Ok(()) => ErrorCode::None,
                    Err(e) => e.code(),
                };
                Ok(error_reply(header.correlation_id, error))
            }
            other => {
                warn!(api_key = other, "Unknown opcode");
                Ok(error_reply(header.correlation_id, ErrorCode::Unknown))
            }
        }
    }

    /// Role-rejected operations still answer: the code is carried in the
    /// operation's own response shape so clients can parse it.
    fn reject(
        &self,
        header: &RequestHeader,
        mut body: BytesMut,
        code: ErrorCode,
    ) -> Result<Vec<ResponseSegment>> {
        debug!(
            api_key = header.api_key,
            role = %self.role,
            code = code.as_i16(),
            "Operation disallowed for role"
        );
        match header.api_key {
            api_key::PRODUCE => {
                let request = ProduceRequest::decode(&mut body)?;
                let response = ProduceResponse {
                    topics: request
                        .topics
                        .into_iter()
                        .map(|t| ProduceResponseTopic {
                            name: t.name,
                            partitions: t
                                .partitions
                                .into_iter()
                                .map(|p| ProduceResponsePartition {
                                    partition: p.partition,
                                    error: code.as_i16(),
                                    offset: -1,
                                })
                                .collect(),
                        })
                        .collect(),
                };
                let mut out = BytesMut::new();
                response.encode(&mut out);
                Ok(inline(header.correlation_id, &out))
            }
            api_key::FETCH | api_key::FETCH2 => {
                let request = FetchRequest::decode(&mut body, header.api_key == api_key::FETCH2)?;
                let resolved = request
                    .topics
                    .iter()
                    .map(|t| {
                        (
                            t.name.clone(),
                            t.partitions
                                .iter()
                                .map(|p| (p.partition, code.as_i16(), -1i64, None))
                                .collect(),
                        )
                    })
                    .collect();
                Ok(assemble_fetch_response(header.correlation_id, resolved))
            }
            api_key::REPLICATE => {
                let request = ReplicateRequest::decode(&mut body)?;
                let response =
                    crate::protocol::messages::ReplicateResponse::failed(request.partition, code);
                let mut out = BytesMut::new();
                response.encode(&mut out);
                Ok(inline(header.correlation_id, &out))
            }
            _ => Ok(error_reply(header.correlation_id, code)),
        }
    }

    async fn handle_produce(
        &self,
        header: &RequestHeader,
        body: &mut BytesMut,
    ) -> Result<Vec<ResponseSegment>> {
        let request = ProduceRequest::decode(body)?;
        let mut topics = Vec::with_capacity(request.topics.len());

        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for p in topic.partitions {
                let result = self
                    .supervisor
                    .produce(&topic.name, p.partition, p.records)
                    .await;
                partitions.push(match result {
                    Ok(last) => ProduceResponsePartition {
                        partition: p.partition,
                        error: ErrorCode::None.as_i16(),
                        offset: last,
                    },
                    Err(VgError::UnknownTopicOrPartition(_, _)) => ProduceResponsePartition {
                        partition: p.partition,
                        error: ErrorCode::UnknownTopicOrPartition.as_i16(),
                        offset: 0,
                    },
                    Err(e) => {
                        warn!(topic = %topic.name, partition = p.partition, error = %e, "Produce failed");
                        ProduceResponsePartition {
                            partition: p.partition,
                            error: e.code().as_i16(),
                            offset: -1,
                        }
                    }
                });
            }
            topics.push(ProduceResponseTopic {
                name: topic.name,
                partitions,
            });
        }

        let response = ProduceResponse { topics };
        let mut out = BytesMut::new();
        response.encode(&mut out);
        Ok(inline(header.correlation_id, &out))
    }

    fn handle_fetch(
        &self,
        header: &RequestHeader,
        body: &mut BytesMut,
        with_limit: bool,
    ) -> Result<Vec<ResponseSegment>> {
        let request = FetchRequest::decode(body, with_limit)?;
        let registry = self.supervisor.registry();

        let mut resolved = Vec::with_capacity(request.topics.len());
        for topic in &request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for p in &topic.partitions {
                let entry = match registry.get(&topic.name, p.partition) {
                    None => (
                        p.partition,
                        ErrorCode::UnknownTopicOrPartition.as_i16(),
                        -1i64,
                        None,
                    ),
                    Some(log) => match log.fetch(p.offset, p.max_bytes, p.limit) {
                        Ok(range) => (
                            p.partition,
                            ErrorCode::None.as_i16(),
                            range.high_water_mark,
                            range.slice,
                        ),
                        Err(e) => {
                            warn!(topic = %topic.name, partition = p.partition, error = %e, "Fetch failed");
                            (p.partition, e.code().as_i16(), -1, None)
                        }
                    },
                };
                partitions.push(entry);
            }
            resolved.push((topic.name.clone(), partitions));
        }

        Ok(assemble_fetch_response(header.correlation_id, resolved))
    }

    fn handle_metadata(
        &self,
        header: &RequestHeader,
        body: &mut BytesMut,
    ) -> Result<Vec<ResponseSegment>> {
        let request = MetadataRequest::decode(body)?;
        let registry = self.supervisor.registry();
        let chains = registry.chain_map().snapshot();

        // Dense node-id space: per chain, the head gets the next id and the
        // tail reuses it when its endpoint is the same
        let mut brokers = Vec::new();
        let mut chain_ids = Vec::with_capacity(chains.len());
        for chain in chains.iter() {
            let head_id = brokers.len() as i32;
            brokers.push(Broker {
                node_id: head_id,
                host: chain.head.host.clone(),
                port: chain.head.port as i32,
            });
            let tail_id = if chain.tail == chain.head {
                head_id
            } else {
                let id = brokers.len() as i32;
                brokers.push(Broker {
                    node_id: id,
                    host: chain.tail.host.clone(),
                    port: chain.tail.port as i32,
                });
                id
            };
            chain_ids.push((head_id, tail_id));
        }

        let requested = if request.topics.is_empty() {
            registry.list()
        } else {
            request.topics
        };

        let mut topics = Vec::new();
        for name in requested {
            // Topics that do not exist are silently omitted; clients probe
            // existence this way
            let Some(partition_count) = registry.partition_count(&name) else {
                continue;
            };
            let chain_index = chains.iter().position(|c| c.covers(&name));
            match chain_index {
                Some(i) => {
                    let (head_id, tail_id) = chain_ids[i];
                    let replicas = if head_id == tail_id {
                        vec![head_id]
                    } else {
                        vec![head_id, tail_id]
                    };
                    let partitions = (0..partition_count)
                        .map(|partition| PartitionMetadata {
                            error: ErrorCode::None.as_i16(),
                            partition,
                            leader: head_id,
                            replicas: replicas.clone(),
                            isr: replicas.clone(),
                        })
                        .collect();
                    topics.push(TopicMetadata {
                        error: ErrorCode::None.as_i16(),
                        name,
                        partitions,
                    });
                }
                None => topics.push(TopicMetadata {
                    error: ErrorCode::TopicMapChanged.as_i16(),
                    name,
                    partitions: Vec::new(),
                }),
            }
        }

        let response = MetadataResponse { brokers, topics };
        let mut out = BytesMut::new();
        response.encode(&mut out);
        Ok(inline(header.correlation_id, &out))
    }
}

type ResolvedPartition = (i32, i16, i64, Option<FileSlice>);

/// Assemble a fetch response as scatter/gather segments: the length and
/// envelope are written eagerly from the already-known range sizes, then
/// inline headers interleave with zero-copy file ranges.
fn assemble_fetch_response(
    correlation_id: i32,
    topics: Vec<(String, Vec<ResolvedPartition>)>,
) -> Vec<ResponseSegment> {
    let mut body_len: usize = 4;
    for (name, partitions) in &topics {
        body_len += 2 + name.len() + 4;
        for (_, _, _, slice) in partitions {
            body_len += 4 + 2 + 8 + 4;
            if let Some(slice) = slice {
                body_len += slice.bytes as usize;
            }
        }
    }

    let mut segments = Vec::new();
    let mut inline = BytesMut::with_capacity(128);
    inline.put_i32(4 + body_len as i32);
    inline.put_i32(correlation_id);
    inline.put_i32(topics.len() as i32);

    for (name, partitions) in topics {
        encode_fetch_topic_header(&mut inline, &name, partitions.len() as i32);
        for (partition, error, high_water_mark, slice) in partitions {
            let set_size = slice.as_ref().map(|s| s.bytes as i32).unwrap_or(0);
            encode_fetch_partition_header(
                &mut inline,
                partition,
                error,
                high_water_mark,
                set_size,
            );
            if let Some(slice) = slice {
                if slice.bytes > 0 {
                    segments.push(ResponseSegment::Inline(inline.split().freeze()));
                    segments.push(ResponseSegment::FileRange(slice));
                }
            }
        }
    }
    if !inline.is_empty() {
        segments.push(ResponseSegment::Inline(inline.freeze()));
    }
    segments
}

fn inline(correlation_id: i32, body: &[u8]) -> Vec<ResponseSegment> {
    vec![ResponseSegment::Inline(
        frame_response(correlation_id, body).freeze(),
    )]
}

fn error_reply(correlation_id: i32, code: ErrorCode) -> Vec<ResponseSegment> {
    let mut body = BytesMut::new();
    ErrorResponse {
        error: code.as_i16(),
    }
    .encode(&mut body);
    inline(correlation_id, &body)
}
