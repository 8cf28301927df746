//! Validator lane scheduling.
//!
//! Lane `n` trails the sprint head by `(n + 1)` spacings, so even lane 0
//! keeps a full spacing of settling distance while higher lanes re-check
//! progressively older history. Leasing picks the finished range with the
//! fewest completed passes below the lane's ceiling and flips its pass
//! counter negative until the pass completes.

use std::sync::Arc;

use crate::sprint::store::{RangeRecord, SprintStore, StoreError};
use crate::types::config::SprintSettings;

/// Lease at most one range per lane. `head` is the last successfully
/// committed block, not the chain head; validation never runs ahead of
/// ingestion.
pub async fn lease_validation_tasks(
    store: &Arc<dyn SprintStore>,
    settings: &SprintSettings,
    stage: &str,
    head: u64,
) -> Result<Vec<(RangeRecord, usize)>, StoreError> {
    let mut leased = Vec::new();
    for lane in 0..settings.validator_count {
        let ceiling = match head.checked_sub(settings.validator_spacing * (lane + 1) as u64) {
            Some(ceiling) => ceiling,
            None => continue,
        };
        if ceiling < settings.start_block {
            continue;
        }
        if let Some(record) = store.lease_validation_range(stage, ceiling).await? {
            leased.push((record, lane));
        }
    }
    Ok(leased)
}
