//! Open registration of event prototypes, dispatched by topic hash.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Filter;
use thiserror::Error;

use super::EventPrototype;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot add event group: duplicate group id {0}")]
    DuplicateGroup(String),

    #[error("cannot add event: duplicate event topic {0}")]
    DuplicateTopic(B256),
}

/// One address/topic group, queried as a single `eth_getLogs` filter per
/// task range.
struct EventGroup {
    addresses: Vec<Address>,
    topics: Vec<B256>,
}

/// Maps topic hashes to event prototypes and groups them into log filters.
///
/// Registration happens once at startup, before the sprint runs; duplicate
/// topics are a fatal setup error.
#[derive(Default)]
pub struct EventRegistry {
    groups: HashMap<String, EventGroup>,
    prototypes: HashMap<B256, Arc<dyn EventPrototype>>,
    allow_addresses: Vec<Address>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group of prototypes filtered over the given addresses.
    pub fn register_group(
        &mut self,
        group_id: &str,
        addresses: Vec<Address>,
        prototypes: Vec<Arc<dyn EventPrototype>>,
    ) -> Result<(), RegistryError> {
        if self.groups.contains_key(group_id) {
            return Err(RegistryError::DuplicateGroup(group_id.to_string()));
        }
        for proto in &prototypes {
            if self.prototypes.contains_key(&proto.topic0()) {
                return Err(RegistryError::DuplicateTopic(proto.topic0()));
            }
        }

        let mut topics = Vec::with_capacity(prototypes.len());
        for proto in prototypes {
            topics.push(proto.topic0());
            self.prototypes.insert(proto.topic0(), proto);
        }
        self.groups.insert(
            group_id.to_string(),
            EventGroup { addresses, topics },
        );
        Ok(())
    }

    /// Addresses that are never filtered out, regardless of discovery state.
    pub fn allow_addresses(&mut self, addrs: impl IntoIterator<Item = Address>) {
        self.allow_addresses.extend(addrs);
    }

    pub fn allowed_addresses(&self) -> &[Address] {
        &self.allow_addresses
    }

    pub fn lookup(&self, topic: &B256) -> Option<&Arc<dyn EventPrototype>> {
        self.prototypes.get(topic)
    }

    /// One filter per group covering `[start_block, end_block]` inclusive.
    pub fn stage_filters(&self, start_block: u64, end_block: u64) -> Vec<Filter> {
        self.groups
            .values()
            .map(|group| {
                let mut filter = Filter::new()
                    .from_block(start_block)
                    .to_block(end_block)
                    .event_signature(group.topics.clone());
                if !group.addresses.is_empty() {
                    filter = filter.address(group.addresses.clone());
                }
                filter
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}
