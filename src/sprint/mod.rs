//! Crash-recoverable, order-preserving chain ingestion.
//!
//! The sprint runs three periodic activities over a shared progress table:
//! scheduling (extend the table toward the chain head), execution (claim
//! ranges, gather their events concurrently, commit in order) and validation
//! (re-execute finished ranges on trailing lanes and repair reorgs).

pub mod block_cache;
pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod range;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod validator;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::events::EventRegistry;
use crate::rpc::ChainRpc;
use crate::types::config::{ConfigError, SprintSettings};

use block_cache::BlockCache;
use pipeline::Pipeline;
use queue::{ExecutionQueue, QueueReceivers};
use status::SprintStatus;
use store::{SprintStore, StoreError};

/// Seconds since the epoch, used for progress timestamps.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum SprintError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("sprint is already running")]
    Active,
}

pub struct Sprint {
    stage: String,
    settings: SprintSettings,
    store: Arc<dyn SprintStore>,
    rpc: Arc<dyn ChainRpc>,
    queue: Arc<ExecutionQueue>,
    receivers: Mutex<Option<QueueReceivers>>,
    status: Arc<SprintStatus>,
}

impl Sprint {
    pub fn new(
        stage: &str,
        settings: SprintSettings,
        store: Arc<dyn SprintStore>,
        rpc: Arc<dyn ChainRpc>,
        registry: Arc<EventRegistry>,
    ) -> Result<Self, SprintError> {
        settings.validate()?;

        let status = Arc::new(SprintStatus::new(settings.verbose, settings.validator_count));
        let block_cache = BlockCache::new(Arc::clone(&rpc), settings.workers);
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&rpc),
            block_cache,
            registry,
            Arc::clone(&store),
        ));
        let (queue, receivers) = ExecutionQueue::new(pipeline, Arc::clone(&status), &settings);

        Ok(Self {
            stage: stage.to_string(),
            settings,
            store,
            rpc,
            queue: Arc::new(queue),
            receivers: Mutex::new(Some(receivers)),
            status,
        })
    }

    pub fn status(&self) -> &Arc<SprintStatus> {
        &self.status
    }

    /// Run until the token is cancelled. Can only be called once.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SprintError> {
        let receivers = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or(SprintError::Active)?;

        let recovery = self.store.recover_leases(&self.stage).await?;
        if recovery.claims_reset > 0 || recovery.validator_leases_reset > 0 {
            info!(
                claims_reset = recovery.claims_reset,
                validator_leases_reset = recovery.validator_leases_reset,
                "recovered leases from an unclean shutdown"
            );
        }

        match self.store.max_finished_block(&self.stage).await? {
            Some(block) => self.status.set_last_successful(block),
            None => {
                if self.settings.start_block > 0 {
                    self.status.set_last_successful(self.settings.start_block - 1);
                }
            }
        }

        let queue_runner = {
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            let workers = self.settings.workers;
            tokio::spawn(async move { queue.run(receivers, workers, cancel).await })
        };
        let status_logger = {
            let status = Arc::clone(&self.status);
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                status
                    .run_log_loop(cancel, move || {
                        (queue.task_queue_depth(), queue.validation_queue_depth())
                    })
                    .await
            })
        };

        let mut schedule_ticker = interval(self.settings.schedule_interval());
        schedule_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut execute_ticker = interval(self.settings.execute_interval());
        execute_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = schedule_ticker.tick() => {
                    if let Err(e) = scheduler::schedule(
                        &self.store,
                        &self.rpc,
                        &self.settings,
                        &self.stage,
                        &self.status,
                    )
                    .await
                    {
                        error!(error = %e, "scheduling pass failed");
                    }
                }
                _ = execute_ticker.tick() => {
                    if let Err(e) = self.execute_tick(&cancel).await {
                        error!(error = %e, "execution pass failed");
                    }
                }
            }
        }

        let _ = queue_runner.await;
        let _ = status_logger.await;
        Ok(())
    }

    /// Claim unscheduled ranges up to the worker count and submit them, then
    /// top up the validator lanes if there is queue headroom for all of them.
    async fn execute_tick(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let claimed = self
            .store
            .claim_ranges(&self.stage, self.settings.workers)
            .await?;
        for record in claimed {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                submitted = self.queue.add_task(record) => {
                    if !submitted {
                        return Ok(());
                    }
                }
            }
        }

        if self.settings.validator_count == 0 {
            return Ok(());
        }
        if self.queue.validation_headroom() < self.settings.validator_count {
            return Ok(());
        }
        let head = self.status.last_successful();
        if head < 0 {
            return Ok(());
        }

        let leased =
            validator::lease_validation_tasks(&self.store, &self.settings, &self.stage, head as u64)
                .await?;
        for (record, lane) in leased {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                submitted = self.queue.add_validation_task(record, lane) => {
                    if !submitted {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}
