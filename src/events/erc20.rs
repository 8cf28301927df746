//! ERC-20 `Transfer` prototype.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::rpc::types::Log;
use serde_json::json;

use super::{AddressSet, DomainEvent, EventError, EventPrototype};
use crate::sprint::block_cache::BlockInfo;

pub struct TransferEvent {
    topic: B256,
}

impl TransferEvent {
    pub fn new() -> Self {
        Self {
            topic: keccak256("Transfer(address,address,uint256)"),
        }
    }
}

impl Default for TransferEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPrototype for TransferEvent {
    fn name(&self) -> &'static str {
        "erc20_transfer"
    }

    fn topic0(&self) -> B256 {
        self.topic
    }

    fn populate(
        &self,
        _addresses: &mut AddressSet,
        log: &Log,
        block: &BlockInfo,
    ) -> Result<Option<DomainEvent>, EventError> {
        let topics = log.inner.data.topics();
        if topics.len() != 3 {
            return Err(EventError::Malformed {
                name: self.name(),
                block: block.number,
                reason: format!("expected 3 topics, got {}", topics.len()),
            });
        }
        let data = log.inner.data.data.as_ref();
        if data.len() != 32 {
            return Err(EventError::Malformed {
                name: self.name(),
                block: block.number,
                reason: format!("expected 32 data bytes, got {}", data.len()),
            });
        }

        let from = Address::from_word(topics[1]);
        let to = Address::from_word(topics[2]);
        let value = U256::from_be_slice(data);

        Ok(Some(DomainEvent {
            name: self.name().to_string(),
            address: log.inner.address,
            block_number: block.number,
            log_index: log.log_index.unwrap_or_default(),
            tx_hash: log.transaction_hash.unwrap_or_default(),
            timestamp: block.timestamp,
            payload: json!({
                "from": format!("{from:#x}"),
                "to": format!("{to:#x}"),
                "value": value.to_string(),
            }),
        }))
    }
}
