//! Chain supervisor: produce orchestration and write repair
//!
//! The supervisor owns this node's role, its connection to the next hop,
//! and the repair protocol that keeps a chain convergent when replicas
//! disagree about the next offset:
//!
//! - A downstream that is **ahead** replies `write_repair` carrying its own
//!   records from the expected offset. The upstream truncates back to that
//!   offset, adopts the carried records, re-appends the in-flight produce
//!   payloads at the new tail, and re-drives. A middle propagates the same
//!   repair to its upstream instead of re-appending, so the authoritative
//!   records reach the head.
//! - A downstream that is **behind** replies `write_repair` with the offset
//!   it needs the stream restarted from and no records. The upstream
//!   backfills that gap from its own log and re-drives; a gap it cannot
//!   supply is fatal and tears the replication stream down.
//!
//! Every repair strictly shrinks the offset gap, so the loop converges.
//! The produce reply to the client is issued only after the tail's ack has
//! unwound the whole chain.

use crate::chain::client::ChainClient;
use crate::chain::role::Role;
use crate::error::{ErrorCode, Result, VgError};
use crate::protocol::messages::{ReplicateRequest, ReplicateResponse};
use crate::storage::log::{PartitionLog, ReplicatedAppend};
use crate::storage::record::Record;
use crate::storage::topics::TopicRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// Bound on repair rounds per request; each round shrinks the gap, so this
/// is only hit when a peer misbehaves
const MAX_REPAIR_ROUNDS: usize = 16;

/// Outcome of driving one record set to the downstream
enum DriveOutcome {
    /// The tail ack unwound back to us
    Acked(i64),
    /// Downstream is ahead; carries its authoritative records starting at
    /// the offset we sent
    AheadRepair(Vec<Record>),
}

pub struct ChainSupervisor {
    registry: Arc<TopicRegistry>,
    role: Role,
    next_hop: Option<ChainClient>,
}

impl ChainSupervisor {
    pub fn new(registry: Arc<TopicRegistry>, role: Role, next_hop: Option<ChainClient>) -> Self {
        if let Some(next) = &next_hop {
            info!(role = %role, next_hop = %next.addr(), "Chain supervisor started");
        } else {
            info!(role = %role, "Chain supervisor started (no downstream)");
        }
        Self {
            registry,
            role,
            next_hop,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Entry-node produce: append locally, then drive the records down the
    /// chain until the tail ack returns. Resolves ahead-repair by adopting
    /// the downstream's records and re-appending the client payloads after
    /// them.
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payloads: Vec<Record>,
    ) -> Result<i64> {
        let log = self
            .registry
            .get(topic, partition)
            .ok_or_else(|| VgError::UnknownTopicOrPartition(topic.to_string(), partition))?;

        let mut records = payloads;
        let last = log.append(&mut records)?;

        if self.next_hop.is_none() || records.is_empty() {
            return Ok(last);
        }

        for _ in 0..MAX_REPAIR_ROUNDS {
            match self.drive(&log, topic, partition, &mut records).await? {
                DriveOutcome::Acked(last) => return Ok(last),
                DriveOutcome::AheadRepair(carried) => {
                    let first = records[0].offset;
                    validate_repair_records(&carried, first)?;

                    warn!(
                        topic = %topic,
                        partition,
                        first,
                        carried = carried.len(),
                        "Adopting downstream records, re-appending produce payloads"
                    );
                    log.truncate(first)?;
                    log.append_assigned(&carried)?;

                    let mut fresh: Vec<Record> = records
                        .iter()
                        .map(|r| Record {
                            offset: -1,
                            attributes: r.attributes,
                            value: r.value.clone(),
                        })
                        .collect();
                    log.append(&mut fresh)?;
                    records = fresh;
                }
            }
        }
        self.teardown().await;
        Err(VgError::Timeout(format!(
            "{topic}-{partition}: write repair did not converge"
        )))
    }

    /// Replica-side replicate handling: append (or answer with repair),
    /// then forward down the chain before acking upstream.
    pub async fn handle_replicate(&self, request: ReplicateRequest) -> ReplicateResponse {
        let partition = request.partition;

        let log = match self.lazy_partition(&request.topic, partition) {
            Ok(log) => log,
            Err(_) => {
                return ReplicateResponse::failed(partition, ErrorCode::UnknownTopicOrPartition)
            }
        };

        let appended_last =
            match log.replicated_append(request.expected_first_offset, &request.records) {
                Ok(ReplicatedAppend::Appended(last)) => last,
                Ok(ReplicatedAppend::Ahead(missing)) => {
                    return ReplicateResponse::write_repair(partition, log.next_offset(), missing)
                }
                Ok(ReplicatedAppend::Behind { needed_from }) => {
                    return ReplicateResponse::write_repair(partition, needed_from, Vec::new())
                }
                Err(e) => {
                    warn!(topic = %request.topic, partition, error = %e, "Replicated append failed");
                    return ReplicateResponse::failed(partition, e.code());
                }
            };

        if self.next_hop.is_none() || request.records.is_empty() {
            return ReplicateResponse::appended(partition, appended_last);
        }

        // Interior node: the upstream ack must wait for our downstream
        let mut records = request.records;
        match self
            .drive(&log, &request.topic, partition, &mut records)
            .await
        {
            Ok(DriveOutcome::Acked(last)) => ReplicateResponse::appended(partition, last),
            Ok(DriveOutcome::AheadRepair(carried)) => {
                // Adopt the downstream's records, then propagate the repair
                // upstream so the head re-drives from the new tail
                let first = carried[0].offset;
                if let Err(e) = log
                    .truncate(first)
                    .and_then(|_| log.append_assigned(&carried))
                {
                    warn!(topic = %request.topic, partition, error = %e, "Repair adoption failed");
                    return ReplicateResponse::failed(partition, ErrorCode::Timeout);
                }
                ReplicateResponse::write_repair(partition, log.next_offset(), carried)
            }
            Err(_) => {
                self.teardown().await;
                ReplicateResponse::failed(partition, ErrorCode::Timeout)
            }
        }
    }

    /// Entry-node delete: remove locally, then propagate down the chain.
    /// The client ack unwinds from the tail like produce.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.registry.delete(topic)?;
        self.propagate_delete(topic).await
    }

    /// Replica-side delete propagation; an already-absent topic is fine
    pub async fn handle_replicate_delete(&self, topic: &str) -> Result<()> {
        match self.registry.delete(topic) {
            Ok(()) | Err(VgError::UnknownTopicOrPartition(_, _)) => {}
            Err(e) => return Err(e),
        }
        self.propagate_delete(topic).await
    }

    async fn propagate_delete(&self, topic: &str) -> Result<()> {
        let Some(next) = &self.next_hop else {
            return Ok(());
        };
        let code = next.replicate_delete_topic(topic).await?;
        match ErrorCode::from_i16(code) {
            ErrorCode::None | ErrorCode::UnknownTopicOrPartition => Ok(()),
            other => {
                self.teardown().await;
                Err(VgError::Timeout(format!(
                    "delete of {topic} rejected downstream: {other:?}"
                )))
            }
        }
    }

    /// Drive one record set downstream, resolving behind-repair from our own
    /// log in place. Ahead-repair is returned to the caller, which resolves
    /// it differently at the head than at a middle.
    async fn drive(
        &self,
        log: &Arc<PartitionLog>,
        topic: &str,
        partition: i32,
        records: &mut Vec<Record>,
    ) -> Result<DriveOutcome> {
        let next = self.next_hop.as_ref().expect("drive requires a downstream");

        for _ in 0..MAX_REPAIR_ROUNDS {
            let first = records[0].offset;
            let response = match next.replicate(topic, partition, first, records).await {
                Ok(response) => response,
                Err(e) => {
                    next.reset().await;
                    return Err(e);
                }
            };

            match ErrorCode::from_i16(response.error) {
                ErrorCode::None => return Ok(DriveOutcome::Acked(response.offset)),
                ErrorCode::WriteRepair if !response.records.is_empty() => {
                    return Ok(DriveOutcome::AheadRepair(response.records));
                }
                ErrorCode::WriteRepair => {
                    // Downstream is behind; restart the stream from the
                    // offset it asked for, backfilled from our own log
                    let needed = response.offset;
                    if needed < 0 || needed >= first {
                        next.reset().await;
                        return Err(VgError::ChainDown(format!(
                            "{topic}-{partition}: nonsensical repair cursor {needed} (stream at {first})"
                        )));
                    }
                    let backfill = log.read_records(needed, first)?;
                    if backfill.len() as i64 != first - needed {
                        // The gap predates our earliest retained record
                        next.reset().await;
                        return Err(VgError::Timeout(format!(
                            "{topic}-{partition}: cannot supply repair gap [{needed}, {first})"
                        )));
                    }
                    warn!(
                        topic = %topic,
                        partition,
                        needed,
                        first,
                        "Downstream behind, restarting stream with backfill"
                    );
                    let mut restarted = backfill;
                    restarted.append(records);
                    *records = restarted;
                }
                other => {
                    next.reset().await;
                    return Err(VgError::ChainDown(format!(
                        "{topic}-{partition}: downstream replied {other:?}"
                    )));
                }
            }
        }

        next.reset().await;
        Err(VgError::Timeout(format!(
            "{topic}-{partition}: write repair did not converge"
        )))
    }

    /// Replicas create unknown topics lazily on first replicate
    fn lazy_partition(&self, topic: &str, partition: i32) -> Result<Arc<PartitionLog>> {
        if let Some(log) = self.registry.get(topic, partition) {
            return Ok(log);
        }
        self.registry.create(topic, partition + 1)?;
        self.registry
            .get(topic, partition)
            .ok_or_else(|| VgError::UnknownTopicOrPartition(topic.to_string(), partition))
    }

    async fn teardown(&self) {
        if let Some(next) = &self.next_hop {
            next.reset().await;
        }
    }
}

/// Repair records must start at the expected offset and be dense
fn validate_repair_records(records: &[Record], first: i64) -> Result<()> {
    if records.first().map(|r| r.offset) != Some(first) {
        return Err(VgError::Timeout(format!(
            "repair records start at {:?}, expected {first}",
            records.first().map(|r| r.offset)
        )));
    }
    for pair in records.windows(2) {
        if pair[1].offset != pair[0].offset + 1 {
            return Err(VgError::Timeout(format!(
                "repair records not dense at {}",
                pair[1].offset
            )));
        }
    }
    Ok(())
}
