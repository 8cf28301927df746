//! Shared progress gauges and periodic status logging.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Gauges updated by the schedule loop and the commit drains. All fields use
/// -1 for "not yet observed" so a fresh start is distinguishable from block 0.
pub struct SprintStatus {
    verbose: bool,
    chain_head: AtomicI64,
    last_successful_block: AtomicI64,
    validator_blocks: Vec<AtomicI64>,
}

impl SprintStatus {
    pub fn new(verbose: bool, validator_count: usize) -> Self {
        Self {
            verbose,
            chain_head: AtomicI64::new(-1),
            last_successful_block: AtomicI64::new(-1),
            validator_blocks: (0..validator_count).map(|_| AtomicI64::new(-1)).collect(),
        }
    }

    pub fn set_chain_head(&self, block: u64) {
        self.chain_head.store(block as i64, Ordering::Relaxed);
    }

    pub fn chain_head(&self) -> i64 {
        self.chain_head.load(Ordering::Relaxed)
    }

    /// Monotone: the commit drain only ever moves forward.
    pub fn set_last_successful(&self, block: u64) {
        self.last_successful_block
            .fetch_max(block as i64, Ordering::Relaxed);
    }

    pub fn last_successful(&self) -> i64 {
        self.last_successful_block.load(Ordering::Relaxed)
    }

    pub fn set_validator_progress(&self, lane: usize, block: u64) {
        if let Some(gauge) = self.validator_blocks.get(lane) {
            gauge.fetch_max(block as i64, Ordering::Relaxed);
        }
    }

    pub fn validator_progress(&self, lane: usize) -> i64 {
        self.validator_blocks
            .get(lane)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(-1)
    }

    pub fn log_task_success(&self, start_block: u64, end_block: u64, duration_s: f64, event_count: usize) {
        if !self.verbose {
            return;
        }
        info!(
            start_block,
            end_block,
            duration_s = format!("{duration_s:.2}"),
            block_time_s = format!("{:.4}", calculate_block_time(start_block, end_block, duration_s)),
            event_count,
            "range complete"
        );
    }

    pub fn log_validation_success(&self, lane: usize, start_block: u64, end_block: u64, reorg_detected: bool) {
        if !self.verbose {
            return;
        }
        info!(lane, start_block, end_block, reorg_detected, "validation complete");
    }

    /// Periodic one-line summary until cancelled. Runs only in verbose mode.
    /// `queue_depths` samples the execution queue as (tasks, validations).
    pub async fn run_log_loop<F>(&self, cancel: CancellationToken, queue_depths: F)
    where
        F: Fn() -> (usize, usize) + Send,
    {
        if !self.verbose {
            return;
        }
        let mut ticker = interval(STATUS_LOG_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let lanes: Vec<i64> = self
                        .validator_blocks
                        .iter()
                        .map(|g| g.load(Ordering::Relaxed))
                        .collect();
                    let (task_queue_size, validation_queue_size) = queue_depths();
                    debug!(
                        chain_head = self.chain_head(),
                        sprint_head = self.last_successful(),
                        validator_lanes = ?lanes,
                        task_queue_size,
                        validation_queue_size,
                        "sprint status"
                    );
                }
            }
        }
    }
}

/// Seconds of wall time spent per block of the range.
pub fn calculate_block_time(start_block: u64, end_block: u64, duration_s: f64) -> f64 {
    let blocks = end_block.saturating_sub(start_block) + 1;
    duration_s / blocks as f64
}
