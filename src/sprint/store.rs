//! Persistence seam for sprint progress, events and discovered addresses.

use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::db::DbError;
use crate::events::DomainEvent;
use crate::sprint::range::BlockRange;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Lifecycle of a scheduled range. Stored as a small integer so a crashed
/// claim is visible to recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Unscheduled,
    Claimed,
    Finished,
}

impl ExecutionStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ExecutionStatus::Unscheduled => 0,
            ExecutionStatus::Claimed => -1,
            ExecutionStatus::Finished => 1,
        }
    }

    pub fn from_i16(value: i16) -> Result<Self, StoreError> {
        match value {
            0 => Ok(ExecutionStatus::Unscheduled),
            -1 => Ok(ExecutionStatus::Claimed),
            1 => Ok(ExecutionStatus::Finished),
            other => Err(StoreError::Corrupt(format!(
                "unknown execution status {other}"
            ))),
        }
    }
}

/// One row of the progress table.
///
/// `validator_passes` is sign-encoded: `v >= 0` means the range is idle after
/// `v` completed validation passes, `v < 0` means pass `-v` is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRecord {
    pub id: String,
    pub stage: String,
    pub start_block: u64,
    pub end_block: u64,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub message: Option<String>,
    pub validator_passes: i64,
}

impl RangeRecord {
    pub fn new(stage: &str, range: BlockRange) -> Self {
        Self {
            id: range_id(range.start, range.end),
            stage: stage.to_string(),
            start_block: range.start,
            end_block: range.end,
            start_ts: None,
            end_ts: None,
            status: ExecutionStatus::Unscheduled,
            error: None,
            message: None,
            validator_passes: 0,
        }
    }
}

/// Range identity is its exact boundaries.
pub fn range_id(start: u64, end: u64) -> String {
    format!("{start}-{end}")
}

/// What startup recovery undid after an unclean shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseRecovery {
    pub claims_reset: u64,
    pub validator_leases_reset: u64,
}

/// An address found inside event data, remembered with the block it first
/// appeared in so later ranges can seed their filter set deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub address: Address,
    pub block_number: u64,
}

/// The storage operations the sprint core needs. Production uses
/// [`crate::db::PgStore`]; unit tests use an in-memory implementation.
#[async_trait]
pub trait SprintStore: Send + Sync {
    /// Insert newly divided ranges, skipping any that already exist.
    async fn insert_ranges(&self, records: &[RangeRecord]) -> Result<(), StoreError>;

    /// Highest end block of any scheduled range for the stage.
    async fn max_scheduled_block(&self, stage: &str) -> Result<Option<u64>, StoreError>;

    /// Highest end block of any finished range for the stage.
    async fn max_finished_block(&self, stage: &str) -> Result<Option<u64>, StoreError>;

    /// Atomically claim up to `limit` unscheduled ranges, lowest first.
    async fn claim_ranges(&self, stage: &str, limit: usize) -> Result<Vec<RangeRecord>, StoreError>;

    /// Release claims and validator leases left behind by a crash.
    async fn recover_leases(&self, stage: &str) -> Result<LeaseRecovery, StoreError>;

    /// Lease the finished range with the fewest validation passes whose end
    /// block does not exceed `max_end_block`. Flips `validator_passes`
    /// negative while the pass is in flight.
    async fn lease_validation_range(
        &self,
        stage: &str,
        max_end_block: u64,
    ) -> Result<Option<RangeRecord>, StoreError>;

    /// Addresses the stage discovered strictly before `as_of_block`.
    async fn active_addresses(&self, stage: &str, as_of_block: u64)
        -> Result<Vec<Address>, StoreError>;

    /// Persist a finished range: its events, any discovered addresses and the
    /// updated progress row, in one transaction.
    async fn commit_ingested(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError>;

    /// Complete a validation pass that found no divergence.
    async fn mark_validated(&self, record: &RangeRecord) -> Result<(), StoreError>;

    /// Complete a validation pass that found a reorg: delete the range's old
    /// events and write the fresh set, in one transaction.
    async fn replace_events(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError>;

    /// The stage's stored events for `[start, end]`, ordered by block then
    /// log index. Several stages can share a database, so event reads and
    /// writes are always scoped to one stage.
    async fn list_events(
        &self,
        stage: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<DomainEvent>, StoreError>;
}
