//! Bounded-concurrency block context fetcher.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::consensus::Transaction as _;
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Block;
use tokio::sync::Semaphore;

use crate::rpc::{ChainRpc, RpcError};

/// Transaction context for one log. Optional node fields are normalized to
/// zero so callers get uniform value semantics.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub hash: B256,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: U256,
    pub gas: u64,
    pub gas_price: u128,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Block context for one task range, discarded when the task completes.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<TransactionInfo>,
    tx_index: HashMap<B256, usize>,
}

impl BlockInfo {
    pub fn new(number: u64, timestamp: u64, transactions: Vec<TransactionInfo>) -> Self {
        let tx_index = transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.hash, i))
            .collect();
        Self {
            number,
            timestamp,
            transactions,
            tx_index,
        }
    }

    /// Convert a node response, verifying it answers the requested number.
    pub fn from_block(requested: u64, block: Block) -> Result<Self, RpcError> {
        let got = block.header.number;
        if got != requested {
            return Err(RpcError::BlockNumberMismatch { requested, got });
        }
        let timestamp = block.header.timestamp;

        let transactions: Vec<TransactionInfo> = block
            .transactions
            .into_transactions()
            .map(|tx| TransactionInfo {
                hash: *tx.inner.tx_hash(),
                from: tx.inner.signer(),
                to: tx.to().unwrap_or(Address::ZERO),
                nonce: tx.nonce(),
                value: tx.value(),
                gas: tx.gas_limit(),
                gas_price: tx.gas_price().unwrap_or_default(),
                max_fee_per_gas: tx.max_fee_per_gas(),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas().unwrap_or_default(),
            })
            .collect();

        Ok(Self::new(requested, timestamp, transactions))
    }

    pub fn transaction(&self, hash: &B256) -> Option<&TransactionInfo> {
        self.tx_index.get(hash).map(|&i| &self.transactions[i])
    }
}

/// Fetches block context by number with a global bound on outstanding
/// requests, so many concurrent tasks cannot overwhelm the node.
#[derive(Clone)]
pub struct BlockCache {
    rpc: Arc<dyn ChainRpc>,
    permits: Arc<Semaphore>,
}

impl BlockCache {
    pub fn new(rpc: Arc<dyn ChainRpc>, workers: usize) -> Self {
        Self {
            rpc,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Meant to be called concurrently from many tasks.
    pub async fn block_at(&self, number: u64) -> Result<BlockInfo, RpcError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RpcError::Provider("block cache semaphore closed".to_string()))?;

        let block = self
            .rpc
            .block_by_number(number)
            .await?
            .ok_or(RpcError::BlockNotFound(number))?;

        BlockInfo::from_block(number, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_with_txs, MockRpc};
    use alloy::primitives::{address, b256};

    #[tokio::test]
    async fn rejects_block_number_mismatch() {
        let rpc = Arc::new(MockRpc::new(100));
        // Node answers block 7 with a body claiming to be block 8.
        rpc.put_block(7, block_with_txs(8, 1000, &[]));

        let cache = BlockCache::new(rpc, 2);
        let err = cache.block_at(7).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::BlockNumberMismatch { requested: 7, got: 8 }
        ));
    }

    #[tokio::test]
    async fn builds_transaction_lookup() {
        let tx_hash = b256!("1111111111111111111111111111111111111111111111111111111111111111");
        let sender = address!("0000000000000000000000000000000000000009");

        let rpc = Arc::new(MockRpc::new(100));
        rpc.put_block(5, block_with_txs(5, 1234, &[(tx_hash, sender)]));

        let cache = BlockCache::new(rpc, 2);
        let info = cache.block_at(5).await.unwrap();

        assert_eq!(info.number, 5);
        assert_eq!(info.timestamp, 1234);
        let tx = info.transaction(&tx_hash).unwrap();
        assert_eq!(tx.from, sender);
        assert_eq!(tx.max_priority_fee_per_gas, 0);
        assert!(info
            .transaction(&b256!(
                "2222222222222222222222222222222222222222222222222222222222222222"
            ))
            .is_none());
    }

    #[tokio::test]
    async fn missing_block_is_an_error() {
        let rpc = Arc::new(MockRpc::new(100));
        let cache = BlockCache::new(rpc, 1);
        assert!(matches!(
            cache.block_at(3).await.unwrap_err(),
            RpcError::BlockNotFound(3)
        ));
    }
}
