//! The per-range ingestion pipeline: stage logs and block context, filter
//! them through the registry, and commit the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::rpc::types::Log;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::{AddressSet, DomainEvent, EventError, EventRegistry};
use crate::rpc::ChainRpc;
use crate::sprint::block_cache::{BlockCache, BlockInfo};
use crate::sprint::fetch::{stage_block_info, stage_event_logs};
use crate::sprint::range::BlockRange;
use crate::sprint::store::{DiscoveredAddress, ExecutionStatus, RangeRecord, SprintStore, StoreError};
use crate::sprint::unix_now;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),
}

/// Everything gathered for one range, handed from a worker to the committer
/// through the range's ticket.
pub struct EventBatch {
    pub record: RangeRecord,
    pub logs: Vec<Log>,
    pub blocks: HashMap<u64, BlockInfo>,
    /// Validator lane when this batch is a re-execution, `None` for ingestion.
    pub lane: Option<usize>,
}

pub struct Pipeline {
    rpc: Arc<dyn ChainRpc>,
    block_cache: BlockCache,
    registry: Arc<EventRegistry>,
    store: Arc<dyn SprintStore>,
}

impl Pipeline {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        block_cache: BlockCache,
        registry: Arc<EventRegistry>,
        store: Arc<dyn SprintStore>,
    ) -> Self {
        Self {
            rpc,
            block_cache,
            registry,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn SprintStore> {
        &self.store
    }

    /// Stage logs and block context for a range, retrying until it succeeds
    /// or the token is cancelled. Node errors here are always transient from
    /// the pipeline's point of view; a claimed range must not be dropped.
    pub async fn gather(
        &self,
        record: RangeRecord,
        lane: Option<usize>,
        cancel: &CancellationToken,
    ) -> Option<EventBatch> {
        let range = BlockRange {
            start: record.start_block,
            end: record.end_block,
        };
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let logs = match stage_event_logs(&self.rpc, &self.registry, range).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(start_block = range.start, end_block = range.end, error = %e, "log staging failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };
            match stage_block_info(&self.block_cache, &logs).await {
                Ok(blocks) => {
                    return Some(EventBatch {
                        record,
                        logs,
                        blocks,
                        lane,
                    })
                }
                Err(e) => {
                    warn!(start_block = range.start, end_block = range.end, error = %e, "block staging failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            }
        }
    }

    /// Run every staged log through the registry against an address set
    /// seeded with what was active before this range began.
    fn filter_batch(
        &self,
        mut addresses: AddressSet,
        batch: &EventBatch,
    ) -> Result<(Vec<DomainEvent>, Vec<DiscoveredAddress>), PipelineError> {
        let mut events = Vec::new();
        let mut discovered = Vec::new();

        for log in &batch.logs {
            let topics = log.inner.data.topics();
            let proto = match topics.first().and_then(|t| self.registry.lookup(t)) {
                Some(proto) => proto,
                None => continue,
            };
            let block_number = log.block_number.unwrap_or_default();
            let block = batch
                .blocks
                .get(&block_number)
                .ok_or(EventError::MissingBlock(block_number))?;
            if !addresses.contains(&log.inner.address) {
                continue;
            }
            if let Some(tx) = log.transaction_hash {
                if block.transaction(&tx).is_none() {
                    return Err(EventError::MissingTransaction {
                        tx,
                        block: block_number,
                    }
                    .into());
                }
            }

            if let Some(event) = proto.populate(&mut addresses, log, block)? {
                events.push(event);
            }
            for addr in addresses.drain_discovered() {
                discovered.push(DiscoveredAddress {
                    address: addr,
                    block_number,
                });
            }
        }

        Ok((events, discovered))
    }

    async fn seed_addresses(&self, stage: &str, start_block: u64) -> Result<AddressSet, StoreError> {
        let mut seed = self.store.active_addresses(stage, start_block).await?;
        seed.extend_from_slice(self.registry.allowed_addresses());
        let mut set = AddressSet::new(seed);
        // Seed addresses are not discoveries.
        set.drain_discovered();
        Ok(set)
    }

    /// Filter and persist a freshly ingested range. Returns the record as it
    /// was written.
    pub async fn commit_ingested(&self, batch: &EventBatch) -> Result<RangeRecord, PipelineError> {
        let addresses = self
            .seed_addresses(&batch.record.stage, batch.record.start_block)
            .await?;
        let (events, discovered) = self.filter_batch(addresses, batch)?;

        let mut record = batch.record.clone();
        record.status = ExecutionStatus::Finished;
        record.end_ts = Some(unix_now());
        record.error = None;

        self.store
            .commit_ingested(&record, &events, &discovered)
            .await?;
        Ok(record)
    }

    /// Filter a re-executed range and compare it against what is stored.
    /// Divergence means a reorg rewrote history under a finished range; the
    /// stored events are replaced wholesale. Returns the updated record and
    /// whether a reorg was repaired.
    pub async fn commit_validated(
        &self,
        batch: &EventBatch,
    ) -> Result<(RangeRecord, bool), PipelineError> {
        let addresses = self
            .seed_addresses(&batch.record.stage, batch.record.start_block)
            .await?;
        let (events, discovered) = self.filter_batch(addresses, batch)?;

        let stored = self
            .store
            .list_events(
                &batch.record.stage,
                batch.record.start_block,
                batch.record.end_block,
            )
            .await?;

        let mut record = batch.record.clone();
        // Completing the pass flips the in-flight lease back positive.
        record.validator_passes = -record.validator_passes;

        if stored == events {
            self.store.mark_validated(&record).await?;
            return Ok((record, false));
        }

        record.message = Some(format!(
            "reorg detected at time: {} after validator pass {}",
            unix_now(),
            record.validator_passes
        ));
        self.store
            .replace_events(&record, &events, &discovered)
            .await?;
        Ok((record, true))
    }
}
