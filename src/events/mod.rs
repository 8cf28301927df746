//! Event filtering capability consumed by the sprint core.
//!
//! An [`EventPrototype`] knows how to turn one raw log plus its block context
//! into a typed [`DomainEvent`], and may grow the active [`AddressSet`] when
//! the event introduces a new in-scope contract (factory deployments).

pub mod erc20;
pub mod factory;
pub mod registry;

use std::collections::HashSet;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use thiserror::Error;

use crate::sprint::block_cache::BlockInfo;

pub use registry::{EventRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed {name} log at block {block}: {reason}")]
    Malformed {
        name: &'static str,
        block: u64,
        reason: String,
    },

    #[error("missing block context for block {0}")]
    MissingBlock(u64),

    #[error("missing transaction {tx} in block {block}")]
    MissingTransaction { tx: B256, block: u64 },
}

/// The filtered, typed result of applying a registered event definition to a
/// raw log. Events compare equal when every field matches, which is what the
/// validator relies on to detect reorgs.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub name: String,
    pub address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

/// The set of contract addresses currently in scope for filtering.
///
/// Seeded from persisted state per attempt; grows during a single range's
/// filter pass when a prototype discovers a new address. Growth is tracked so
/// the commit can persist what was discovered and at which block.
#[derive(Debug, Default)]
pub struct AddressSet {
    addrs: HashSet<Address>,
    discovered: Vec<Address>,
}

impl AddressSet {
    pub fn new(seed: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addrs: seed.into_iter().collect(),
            discovered: Vec::new(),
        }
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.addrs.contains(addr)
    }

    /// Adds an address discovered mid-range. Visible to every later log in
    /// the same filter pass.
    pub fn insert(&mut self, addr: Address) {
        if self.addrs.insert(addr) {
            self.discovered.push(addr);
        }
    }

    /// Takes the addresses added since the last call.
    pub fn drain_discovered(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.discovered)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// One registered event definition, dispatched by topic0.
pub trait EventPrototype: Send + Sync {
    fn name(&self) -> &'static str;

    /// Topic hash this prototype is registered under. Must be stable.
    fn topic0(&self) -> B256;

    /// Populate a typed event from a raw log and its block context.
    ///
    /// Returns `Ok(None)` when the log decodes but should be dropped. An
    /// error triggers a retry of the whole range. Implementations may insert
    /// into `addresses` to bring newly created contracts into scope for the
    /// remainder of the range.
    fn populate(
        &self,
        addresses: &mut AddressSet,
        log: &Log,
        block: &BlockInfo,
    ) -> Result<Option<DomainEvent>, EventError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn address_set_tracks_discoveries() {
        let a = address!("0000000000000000000000000000000000000001");
        let b = address!("0000000000000000000000000000000000000002");

        let mut set = AddressSet::new([a]);
        assert!(set.contains(&a));
        assert!(!set.contains(&b));

        set.insert(b);
        set.insert(b);
        set.insert(a);
        assert!(set.contains(&b));
        assert_eq!(set.drain_discovered(), vec![b]);
        assert!(set.drain_discovered().is_empty());
    }
}
