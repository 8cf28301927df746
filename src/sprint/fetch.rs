//! Concurrent log and block staging for one task range.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use tokio::task::JoinSet;

use crate::events::EventRegistry;
use crate::rpc::{ChainRpc, RpcError};
use crate::sprint::block_cache::{BlockCache, BlockInfo};
use crate::sprint::range::BlockRange;

/// Query every registered filter group over `range` concurrently and merge
/// the results into one deterministic stream ordered by block then log index.
pub async fn stage_event_logs(
    rpc: &Arc<dyn ChainRpc>,
    registry: &EventRegistry,
    range: BlockRange,
) -> Result<Vec<Log>, RpcError> {
    let filters = registry.stage_filters(range.start, range.end);
    if filters.is_empty() {
        return Ok(Vec::new());
    }

    let mut set = JoinSet::new();
    for filter in filters {
        let rpc = Arc::clone(rpc);
        set.spawn(async move { rpc.get_logs(&filter).await });
    }

    let mut logs = Vec::new();
    while let Some(joined) = set.join_next().await {
        let group_logs =
            joined.map_err(|e| RpcError::Provider(format!("log fetch task failed: {e}")))?;
        logs.extend(group_logs?);
    }

    // Group completion order is nondeterministic; the merged order must not be.
    logs.sort_by_key(|log| (log.block_number.unwrap_or_default(), log.log_index.unwrap_or_default()));
    Ok(logs)
}

/// Fetch full block context for every block referenced by `logs`, verifying
/// that each log's transaction is present in its block.
pub async fn stage_block_info(
    cache: &BlockCache,
    logs: &[Log],
) -> Result<HashMap<u64, BlockInfo>, RpcError> {
    let mut wanted_txs: HashMap<u64, Vec<B256>> = HashMap::new();
    for log in logs {
        let number = match log.block_number {
            Some(number) => number,
            None => return Err(RpcError::Provider("log without block number".to_string())),
        };
        let tx = match log.transaction_hash {
            Some(tx) => tx,
            None => return Err(RpcError::MissingTransaction(number)),
        };
        wanted_txs.entry(number).or_default().push(tx);
    }

    let mut set = JoinSet::new();
    for &number in wanted_txs.keys() {
        let cache = cache.clone();
        set.spawn(async move { cache.block_at(number).await.map(|info| (number, info)) });
    }

    let mut blocks = HashMap::with_capacity(wanted_txs.len());
    while let Some(joined) = set.join_next().await {
        let (number, info) =
            joined.map_err(|e| RpcError::Provider(format!("block fetch task failed: {e}")))??;
        for tx in &wanted_txs[&number] {
            if info.transaction(tx).is_none() {
                return Err(RpcError::MissingTransaction(number));
            }
        }
        blocks.insert(number, info);
    }
    Ok(blocks)
}
