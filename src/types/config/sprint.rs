use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid sprint config: {0}")]
    Invalid(&'static str),
}

/// Tuning knobs for one sprint instance. Loaded from the `sprint` block of
/// `config/config.json` and validated once at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct SprintSettings {
    /// Number of blocks per scheduled range. Too high a value can make
    /// `eth_getLogs` responses unwieldy; balance against `workers`.
    pub blocks_per_stage: u64,
    /// Number of concurrent worker tasks fetching data. On a rate-limited
    /// RPC keep this slightly below the limit, since the scheduler also
    /// needs to poll the chain head.
    pub workers: usize,
    /// Capacity of the ingestion task/ticket queues. Large values increase
    /// memory usage; small values throttle scheduling.
    pub execution_queue_size: usize,
    /// Milliseconds between scheduler passes. Should track the chain's block
    /// time; lower it for lower scheduling latency.
    pub schedule_interval_ms: u64,
    /// Milliseconds between execute passes (claiming ranges and submitting
    /// validator work).
    pub execute_interval_ms: u64,
    /// First block the sprint will ever schedule. Set to the earliest
    /// deployment block of any tracked contract.
    pub start_block: u64,
    /// Number of validator lanes re-checking finished ranges for reorgs.
    /// Zero disables validation.
    #[serde(default)]
    pub validator_count: usize,
    /// Lane spacing: lane `i` works at most `head - spacing * i` blocks.
    #[serde(default)]
    pub validator_spacing: u64,
    /// Capacity of the validation task/ticket queues.
    #[serde(default)]
    pub validator_queue_size: usize,
    /// Enables the periodic status line and per-range completion logs.
    #[serde(default)]
    pub verbose: bool,
}

impl SprintSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks_per_stage == 0 {
            return Err(ConfigError::Invalid("blocks_per_stage must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be greater than 0"));
        }
        if self.execute_interval_ms == 0 {
            return Err(ConfigError::Invalid("execute_interval_ms must be greater than 0"));
        }
        if self.validator_count > 0 && self.validator_spacing == 0 {
            return Err(ConfigError::Invalid(
                "validator_spacing must be greater than 0 when validators are enabled",
            ));
        }
        if self.validator_count > 0 && self.validator_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "validator_queue_size must be greater than 0 when validators are enabled",
            ));
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn execute_interval(&self) -> Duration {
        Duration::from_millis(self.execute_interval_ms)
    }
}

impl Default for SprintSettings {
    fn default() -> Self {
        Self {
            blocks_per_stage: 1000,
            workers: 4,
            execution_queue_size: 32,
            schedule_interval_ms: 12_000,
            execute_interval_ms: 1_000,
            start_block: 0,
            validator_count: 0,
            validator_spacing: 0,
            validator_queue_size: 0,
            verbose: false,
        }
    }
}
