//! Extends the progress table toward the live chain head.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::rpc::{ChainRpc, RpcError};
use crate::sprint::range::divide_range_inclusive;
use crate::sprint::status::SprintStatus;
use crate::sprint::store::{RangeRecord, SprintStore, StoreError};
use crate::types::config::SprintSettings;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain head {head} is below configured start block {start_block}")]
    HeadBelowStart { head: u64, start_block: u64 },
}

/// One scheduling pass: divide `[next unscheduled block, live head]` into
/// ranges and insert them. Re-running after a partial insert is safe because
/// range identity is deterministic and inserts skip existing rows.
///
/// Returns the number of ranges submitted.
pub async fn schedule(
    store: &Arc<dyn SprintStore>,
    rpc: &Arc<dyn ChainRpc>,
    settings: &SprintSettings,
    stage: &str,
    status: &SprintStatus,
) -> Result<usize, ScheduleError> {
    let head = rpc.block_number().await?;
    status.set_chain_head(head);

    let next_start = match store.max_scheduled_block(stage).await? {
        Some(max_end) => max_end + 1,
        None => settings.start_block,
    };

    if head < settings.start_block || next_start < settings.start_block {
        return Err(ScheduleError::HeadBelowStart {
            head,
            start_block: settings.start_block,
        });
    }
    if next_start > head {
        return Ok(0);
    }

    let ranges = divide_range_inclusive(next_start, head, settings.blocks_per_stage);
    let records: Vec<RangeRecord> = ranges
        .iter()
        .map(|&range| RangeRecord::new(stage, range))
        .collect();
    store.insert_ranges(&records).await?;

    debug!(stage, next_start, head, count = records.len(), "scheduled ranges");
    Ok(records.len())
}
