//! Factory `PairCreated` prototype. Creation events bring the new pair
//! contract into scope for the remainder of the range being filtered.

use alloy::primitives::{keccak256, Address, B256};
use alloy::rpc::types::Log;
use serde_json::json;

use super::{AddressSet, DomainEvent, EventError, EventPrototype};
use crate::sprint::block_cache::BlockInfo;

pub struct PairCreatedEvent {
    topic: B256,
}

impl PairCreatedEvent {
    pub fn new() -> Self {
        Self {
            topic: keccak256("PairCreated(address,address,address,uint256)"),
        }
    }
}

impl Default for PairCreatedEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPrototype for PairCreatedEvent {
    fn name(&self) -> &'static str {
        "pair_created"
    }

    fn topic0(&self) -> B256 {
        self.topic
    }

    fn populate(
        &self,
        addresses: &mut AddressSet,
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
        if data.len() != 64 {
            return Err(EventError::Malformed {
                name: self.name(),
                block: block.number,
                reason: format!("expected 64 data bytes, got {}", data.len()),
            });
        }

        let token0 = Address::from_word(topics[1]);
        let token1 = Address::from_word(topics[2]);
        let pair = Address::from_slice(&data[12..32]);

        // The new pair emits tracked events from this point on.
        addresses.insert(pair);

        Ok(Some(DomainEvent {
            name: self.name().to_string(),
            address: log.inner.address,
            block_number: block.number,
            log_index: log.log_index.unwrap_or_default(),
            tx_hash: log.transaction_hash.unwrap_or_default(),
            timestamp: block.timestamp,
            payload: json!({
                "token0": format!("{token0:#x}"),
                "token1": format!("{token1:#x}"),
                "pair": format!("{pair:#x}"),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_info, pair_created_log};
    use alloy::primitives::address;

    #[test]
    fn discovers_the_created_pair() {
        let factory = address!("00000000000000000000000000000000000000bb");
        let token0 = address!("0000000000000000000000000000000000000001");
        let token1 = address!("0000000000000000000000000000000000000002");
        let pair = address!("00000000000000000000000000000000000000cc");

        let log = pair_created_log(factory, token0, token1, pair, 100, 0);
        let block = block_info(100, 1_700_000_000, &[log.transaction_hash.unwrap()]);

        let mut addrs = AddressSet::new([factory]);
        let event = PairCreatedEvent::new()
            .populate(&mut addrs, &log, &block)
            .unwrap()
            .unwrap();

        assert_eq!(event.name, "pair_created");
        assert_eq!(event.payload["pair"], format!("{pair:#x}"));
        assert!(addrs.contains(&pair));
        assert_eq!(addrs.drain_discovered(), vec![pair]);
    }
}
