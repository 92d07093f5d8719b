//! Persistent connection to the next hop in the chain
//!
//! Each node with a downstream keeps one long-lived connection to it.
//! Requests are strictly serialized on that connection; any socket error or
//! round-trip timeout tears the connection down, and the next request
//! reconnects lazily. All chain failures surface to callers as
//! [`VgError::Timeout`], which the produce path reports to clients as
//! `TIMEOUT_ERROR`.

use crate::error::{Result, VgError};
use crate::protocol::codec::{frame_request, RequestHeader};
use crate::protocol::messages::{
    api_key, ErrorResponse, ReplicateRequest, ReplicateResponse, TopicRequest,
};
use crate::storage::record::Record;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Client id sent on chain-internal connections
const CHAIN_CLIENT_ID: &str = "vg-chain";

pub struct ChainClient {
    addr: String,
    round_trip_timeout: Duration,
    correlation: AtomicI32,
    conn: Mutex<Option<TcpStream>>,
}

impl ChainClient {
    pub fn new(addr: impl Into<String>, round_trip_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            round_trip_timeout,
            correlation: AtomicI32::new(0),
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Forward a replicate request and await the downstream verdict
    pub async fn replicate(
        &self,
        topic: &str,
        partition: i32,
        expected_first_offset: i64,
        records: &[Record],
    ) -> Result<ReplicateResponse> {
        let request = ReplicateRequest {
            topic: topic.to_string(),
            partition,
            expected_first_offset,
            records: records.to_vec(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let mut response = self.request(api_key::REPLICATE, &body).await?;
        ReplicateResponse::decode(&mut response)
    }

    /// Propagate a topic delete down the chain
    pub async fn replicate_delete_topic(&self, topic: &str) -> Result<i16> {
        let request = TopicRequest {
            topic: topic.to_string(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body);
        let mut response = self
            .request(api_key::REPLICATE_DELETE_TOPIC, &body)
            .await?;
        Ok(ErrorResponse::decode(&mut response)?.error)
    }

    /// Drop the connection; the next request reconnects lazily
    pub async fn reset(&self) {
        let mut conn = self.conn.lock().await;
        if conn.take().is_some() {
            warn!(next_hop = %self.addr, "Chain connection torn down");
        }
    }

    /// One serialized round trip. Any failure drops the connection and maps
    /// to a timeout.
    async fn request(&self, api_key: i16, body: &[u8]) -> Result<BytesMut> {
        let mut conn = self.conn.lock().await;

        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader {
            api_key,
            api_version: 0,
            correlation_id,
            client_id: Some(CHAIN_CLIENT_ID.to_string()),
        };
        let frame = frame_request(&header, body);

        let result = timeout(self.round_trip_timeout, async {
            if conn.is_none() {
                let stream = TcpStream::connect(&self.addr).await?;
                stream.set_nodelay(true)?;
                debug!(next_hop = %self.addr, "Chain connection established");
                *conn = Some(stream);
            }
            let stream = conn.as_mut().unwrap();

            stream.write_all(&frame).await?;

            let mut length = [0u8; 4];
            stream.read_exact(&mut length).await?;
            let length = i32::from_be_bytes(length);
            if length < 4 {
                return Err(VgError::Protocol(format!(
                    "downstream response frame length {length}"
                )));
            }
            let mut payload = vec![0u8; length as usize];
            stream.read_exact(&mut payload).await?;
            Ok::<BytesMut, VgError>(BytesMut::from(&payload[..]))
        })
        .await;

        match result {
            Ok(Ok(mut payload)) => {
                let got = payload.get_i32();
                if got != correlation_id {
                    *conn = None;
                    return Err(VgError::Timeout(format!(
                        "downstream {} answered correlation {got}, expected {correlation_id}",
                        self.addr
                    )));
                }
                Ok(payload)
            }
            Ok(Err(e)) => {
                *conn = None;
                warn!(next_hop = %self.addr, error = %e, "Chain round trip failed");
                Err(VgError::Timeout(format!("replicate to {}: {e}", self.addr)))
            }
            Err(_) => {
                *conn = None;
                warn!(next_hop = %self.addr, "Chain round trip timed out");
                Err(VgError::Timeout(format!(
                    "replicate to {} timed out",
                    self.addr
                )))
            }
        }
    }
}
