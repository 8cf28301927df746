//! Shared test doubles and fixture builders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use alloy::consensus::transaction::Recovered;
use alloy::consensus::{Signed, TxEnvelope, TxLegacy};
use alloy::primitives::{keccak256, Address, Bytes, LogData, Signature, B256, U256};
use alloy::rpc::types::{Block, BlockTransactions, Filter, Header, Log, Transaction};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::events::DomainEvent;
use crate::rpc::{ChainRpc, RpcError};
use crate::sprint::block_cache::{BlockInfo, TransactionInfo};
use crate::sprint::store::{
    DiscoveredAddress, ExecutionStatus, LeaseRecovery, RangeRecord, SprintStore, StoreError,
};

// ---------------------------------------------------------------------------
// MockRpc

#[derive(Default)]
struct MockRpcState {
    logs: Vec<Log>,
    blocks: HashMap<u64, Block>,
    log_delays: HashMap<u64, Duration>,
    fail_addresses: HashSet<Address>,
    fail_all: bool,
    block_fetches: HashMap<u64, usize>,
}

/// In-memory node answering from seeded logs and blocks.
pub struct MockRpc {
    head: AtomicU64,
    state: StdMutex<MockRpcState>,
}

impl MockRpc {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            state: StdMutex::new(MockRpcState::default()),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::Relaxed);
    }

    pub fn put_log(&self, log: Log) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn put_block(&self, number: u64, block: Block) {
        self.state.lock().unwrap().blocks.insert(number, block);
    }

    /// Delay `get_logs` responses for filters starting at `from_block`.
    pub fn set_log_delay(&self, from_block: u64, delay: Duration) {
        self.state.lock().unwrap().log_delays.insert(from_block, delay);
    }

    /// Fail `get_logs` for any filter covering this address.
    pub fn fail_address(&self, address: Address) {
        self.state.lock().unwrap().fail_addresses.insert(address);
    }

    pub fn fail_all(&self) {
        self.state.lock().unwrap().fail_all = true;
    }

    pub fn block_fetch_count(&self, number: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .block_fetches
            .get(&number)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let (delay, result) = {
            let state = self.state.lock().unwrap();
            if state.fail_all {
                return Err(RpcError::Provider("injected failure".to_string()));
            }
            if state.fail_addresses.iter().any(|a| {
                !filter.address.is_empty() && filter.address.matches(a)
            }) {
                return Err(RpcError::Provider("injected group failure".to_string()));
            }

            let from = filter.get_from_block().unwrap_or(0);
            let to = filter.get_to_block().unwrap_or(u64::MAX);
            let matched: Vec<Log> = state
                .logs
                .iter()
                .filter(|log| {
                    let number = log.block_number.unwrap_or_default();
                    number >= from
                        && number <= to
                        && filter.address.matches(&log.inner.address)
                        && log
                            .inner
                            .data
                            .topics()
                            .first()
                            .is_some_and(|t| filter.topics[0].matches(t))
                })
                .cloned()
                .collect();
            (state.log_delays.get(&from).copied(), matched)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, RpcError> {
        let mut state = self.state.lock().unwrap();
        *state.block_fetches.entry(number).or_default() += 1;
        Ok(state.blocks.get(&number).cloned())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// MemStore

#[derive(Default)]
struct MemState {
    records: BTreeMap<(u64, u64), RangeRecord>,
    events: BTreeMap<(String, u64, u64), DomainEvent>,
    discovered: BTreeMap<(String, Address), u64>,
    commit_order: Vec<String>,
    replacements: usize,
    validations: usize,
}

/// In-memory [`SprintStore`] with the same claim and lease semantics as the
/// postgres implementation, plus instrumentation for assertions.
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
        }
    }

    pub async fn seed_record(&self, record: RangeRecord) {
        self.state
            .lock()
            .await
            .records
            .insert((record.start_block, record.end_block), record);
    }

    pub async fn seed_events(&self, stage: &str, events: Vec<DomainEvent>) {
        let mut state = self.state.lock().await;
        for event in events {
            state
                .events
                .insert((stage.to_string(), event.block_number, event.log_index), event);
        }
    }

    pub async fn seed_discovered(&self, stage: &str, address: Address, block_number: u64) {
        self.state
            .lock()
            .await
            .discovered
            .insert((stage.to_string(), address), block_number);
    }

    pub async fn commit_order(&self) -> Vec<String> {
        self.state.lock().await.commit_order.clone()
    }

    pub async fn replacement_count(&self) -> usize {
        self.state.lock().await.replacements
    }

    pub async fn validation_count(&self) -> usize {
        self.state.lock().await.validations
    }

    pub async fn all_records(&self) -> Vec<RangeRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_events(
    state: &mut MemState,
    stage: &str,
    events: &[DomainEvent],
    discovered: &[DiscoveredAddress],
) {
    for event in events {
        state
            .events
            .entry((stage.to_string(), event.block_number, event.log_index))
            .or_insert_with(|| event.clone());
    }
    for d in discovered {
        state
            .discovered
            .entry((stage.to_string(), d.address))
            .or_insert(d.block_number);
    }
}

#[async_trait]
impl SprintStore for MemStore {
    async fn insert_ranges(&self, records: &[RangeRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for record in records {
            state
                .records
                .entry((record.start_block, record.end_block))
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    async fn max_scheduled_block(&self, stage: &str) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.stage == stage)
            .map(|r| r.end_block)
            .max())
    }

    async fn max_finished_block(&self, stage: &str) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.stage == stage && r.status == ExecutionStatus::Finished)
            .map(|r| r.end_block)
            .max())
    }

    async fn claim_ranges(&self, stage: &str, limit: usize) -> Result<Vec<RangeRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let keys: Vec<(u64, u64)> = state
            .records
            .values()
            .filter(|r| r.stage == stage && r.status == ExecutionStatus::Unscheduled)
            .take(limit)
            .map(|r| (r.start_block, r.end_block))
            .collect();

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = state.records.get_mut(&key) {
                record.status = ExecutionStatus::Claimed;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn recover_leases(&self, stage: &str) -> Result<LeaseRecovery, StoreError> {
        let mut state = self.state.lock().await;
        let mut recovery = LeaseRecovery::default();
        for record in state.records.values_mut().filter(|r| r.stage == stage) {
            if record.status == ExecutionStatus::Claimed {
                record.status = ExecutionStatus::Unscheduled;
                record.start_ts = None;
                recovery.claims_reset += 1;
            }
            if record.validator_passes < 0 {
                record.validator_passes = -record.validator_passes - 1;
                recovery.validator_leases_reset += 1;
            }
        }
        Ok(recovery)
    }

    async fn lease_validation_range(
        &self,
        stage: &str,
        max_end_block: u64,
    ) -> Result<Option<RangeRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let key = state
            .records
            .values()
            .filter(|r| {
                r.stage == stage
                    && r.status == ExecutionStatus::Finished
                    && r.validator_passes >= 0
                    && r.end_block <= max_end_block
            })
            .min_by_key(|r| (r.validator_passes, r.start_block))
            .map(|r| (r.start_block, r.end_block));

        Ok(key.and_then(|key| {
            state.records.get_mut(&key).map(|record| {
                record.validator_passes = -(record.validator_passes + 1);
                record.clone()
            })
        }))
    }

    async fn active_addresses(
        &self,
        stage: &str,
        as_of_block: u64,
    ) -> Result<Vec<Address>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .discovered
            .iter()
            .filter(|((s, _), &block)| s == stage && block < as_of_block)
            .map(|((_, addr), _)| *addr)
            .collect())
    }

    async fn commit_ingested(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        apply_events(&mut state, &record.stage, events, discovered);
        state
            .records
            .insert((record.start_block, record.end_block), record.clone());
        state.commit_order.push(record.id.clone());
        Ok(())
    }

    async fn mark_validated(&self, record: &RangeRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .records
            .insert((record.start_block, record.end_block), record.clone());
        state.validations += 1;
        Ok(())
    }

    async fn replace_events(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stale: Vec<(String, u64, u64)> = state
            .events
            .range(
                (record.stage.clone(), record.start_block, 0)
                    ..=(record.stage.clone(), record.end_block, u64::MAX),
            )
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.events.remove(&key);
        }
        apply_events(&mut state, &record.stage, events, discovered);
        state
            .records
            .insert((record.start_block, record.end_block), record.clone());
        state.replacements += 1;
        Ok(())
    }

    async fn list_events(
        &self,
        stage: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<DomainEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .range((stage.to_string(), start, 0)..=(stage.to_string(), end, u64::MAX))
            .map(|(_, event)| event.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fixture builders

fn fixture_tx_hash(address: Address, block_number: u64, log_index: u64) -> B256 {
    let mut seed = Vec::with_capacity(36);
    seed.extend_from_slice(address.as_slice());
    seed.extend_from_slice(&block_number.to_be_bytes());
    seed.extend_from_slice(&log_index.to_be_bytes());
    keccak256(&seed)
}

fn raw_log(
    address: Address,
    topics: Vec<B256>,
    data: Vec<u8>,
    block_number: u64,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: LogData::new_unchecked(topics, Bytes::from(data)),
        },
        block_hash: None,
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(fixture_tx_hash(address, block_number, log_index)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

pub fn transfer_log(
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    block_number: u64,
    log_index: u64,
) -> Log {
    let topic0 = keccak256("Transfer(address,address,uint256)");
    raw_log(
        token,
        vec![topic0, from.into_word(), to.into_word()],
        value.to_be_bytes::<32>().to_vec(),
        block_number,
        log_index,
    )
}

pub fn pair_created_log(
    factory: Address,
    token0: Address,
    token1: Address,
    pair: Address,
    block_number: u64,
    log_index: u64,
) -> Log {
    let topic0 = keccak256("PairCreated(address,address,address,uint256)");
    let mut data = vec![0u8; 64];
    data[12..32].copy_from_slice(pair.as_slice());
    data[63] = 1;
    raw_log(
        factory,
        vec![topic0, token0.into_word(), token1.into_word()],
        data,
        block_number,
        log_index,
    )
}

pub fn test_tx(hash: B256, from: Address) -> Transaction {
    let tx = TxLegacy::default();
    let signature = Signature::new(U256::from(1), U256::from(1), false);
    let signed = Signed::new_unchecked(tx, signature, hash);
    Transaction {
        inner: Recovered::new_unchecked(TxEnvelope::Legacy(signed), from),
        block_hash: None,
        block_number: None,
        transaction_index: None,
        effective_gas_price: None,
    }
}

pub fn block_with_txs(number: u64, timestamp: u64, txs: &[(B256, Address)]) -> Block {
    let header = Header {
        hash: keccak256(number.to_be_bytes()),
        inner: alloy::consensus::Header {
            number,
            timestamp,
            ..Default::default()
        },
        total_difficulty: None,
        size: None,
    };

    let transactions = txs
        .iter()
        .map(|&(hash, from)| test_tx(hash, from))
        .collect();

    Block {
        header,
        uncles: Vec::new(),
        transactions: BlockTransactions::Full(transactions),
        withdrawals: None,
    }
}

/// Block containing exactly the transactions the given logs reference.
pub fn block_for_logs(number: u64, timestamp: u64, logs: &[&Log]) -> Block {
    let sender = Address::with_last_byte(0x99);
    let txs: Vec<(B256, Address)> = logs
        .iter()
        .filter_map(|log| log.transaction_hash.map(|hash| (hash, sender)))
        .collect();
    block_with_txs(number, timestamp, &txs)
}

pub fn block_info(number: u64, timestamp: u64, tx_hashes: &[B256]) -> BlockInfo {
    let transactions = tx_hashes
        .iter()
        .map(|&hash| TransactionInfo {
            hash,
            from: Address::with_last_byte(0x99),
            to: Address::ZERO,
            nonce: 0,
            value: U256::ZERO,
            gas: 21_000,
            gas_price: 0,
            max_fee_per_gas: 0,
            max_priority_fee_per_gas: 0,
        })
        .collect();
    BlockInfo::new(number, timestamp, transactions)
}
