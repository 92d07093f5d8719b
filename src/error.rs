//! Error types for vonnegut
//!
//! This module defines the crate-wide error type and the wire-level error
//! code table. The wire codes are the Kafka-compatible subset vonnegut
//! speaks plus the chain-replication extension block (129+).

use thiserror::Error;

/// Result type alias for vonnegut operations
pub type Result<T> = std::result::Result<T, VgError>;

/// Wire-level error codes
///
/// Codes 0..=7 follow the Kafka protocol error table; codes 129 and up are
/// vonnegut extensions used by the chain-replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    /// Unknown server error
    Unknown = -1,
    /// No error
    None = 0,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// The topic-to-chain mapping changed; re-fetch metadata
    TopicMapChanged = 6,
    /// Request timed out (also covers downstream socket loss)
    Timeout = 7,
    /// Fetch sent to a role that does not serve reads
    FetchDisallowed = 129,
    /// Produce sent to a role that does not accept writes
    ProduceDisallowed = 131,
    /// Replica and upstream disagree on the next offset; repair in progress
    WriteRepair = 133,
    /// Replicate sent to a role that is not a chain interior or tail
    ReplicateDisallowed = 135,
}

impl ErrorCode {
    /// Convert to the i16 used on the wire
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Parse a wire code; anything unrecognized maps to `Unknown`
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            3 => ErrorCode::UnknownTopicOrPartition,
            6 => ErrorCode::TopicMapChanged,
            7 => ErrorCode::Timeout,
            129 => ErrorCode::FetchDisallowed,
            131 => ErrorCode::ProduceDisallowed,
            133 => ErrorCode::WriteRepair,
            135 => ErrorCode::ReplicateDisallowed,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Errors produced by the storage engine, the wire codec, and the chain
/// replication layer.
#[derive(Debug, Error)]
pub enum VgError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown topic or partition: topic={0}, partition={1}")]
    UnknownTopicOrPartition(String, i32),

    #[error("Corrupted log data: {0}")]
    Corrupt(String),

    #[error("Replicate timeout: {0}")]
    Timeout(String),

    #[error("{op} disallowed for role {role}")]
    Disallowed { op: &'static str, role: &'static str },

    #[error("Chain unavailable: {0}")]
    ChainDown(String),
}

impl VgError {
    /// Map to the wire code reported to clients
    pub fn code(&self) -> ErrorCode {
        match self {
            VgError::UnknownTopicOrPartition(_, _) => ErrorCode::UnknownTopicOrPartition,
            VgError::Timeout(_) | VgError::ChainDown(_) => ErrorCode::Timeout,
            VgError::Disallowed { op, .. } => match *op {
                "fetch" => ErrorCode::FetchDisallowed,
                "produce" => ErrorCode::ProduceDisallowed,
                "replicate" => ErrorCode::ReplicateDisallowed,
                _ => ErrorCode::Unknown,
            },
            _ => ErrorCode::Unknown,
        }
    }
}
