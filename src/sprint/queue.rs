//! Concurrent range execution with order-preserving commits.
//!
//! Each submitted range gets a ticket: a oneshot channel whose receiver is
//! queued in submission order while the range itself is gathered by whichever
//! worker picks it up. The commit drain awaits tickets strictly in order, so
//! ranges may execute out of order but always commit in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::sprint::pipeline::{EventBatch, Pipeline};
use crate::sprint::status::SprintStatus;
use crate::sprint::store::RangeRecord;
use crate::sprint::unix_now;
use crate::types::config::SprintSettings;

const COMMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

struct Task {
    record: RangeRecord,
    lane: Option<usize>,
    done: oneshot::Sender<EventBatch>,
}

type Ticket = oneshot::Receiver<EventBatch>;
type SharedTaskRx = Arc<Mutex<mpsc::Receiver<Task>>>;

/// Receiving halves of the queue channels, consumed once by [`ExecutionQueue::run`].
pub struct QueueReceivers {
    task_rx: mpsc::Receiver<Task>,
    validation_rx: mpsc::Receiver<Task>,
    upload_seq_rx: mpsc::Receiver<Ticket>,
    validation_seq_rx: mpsc::Receiver<Ticket>,
}

pub struct ExecutionQueue {
    pipeline: Arc<Pipeline>,
    status: Arc<SprintStatus>,
    task_tx: mpsc::Sender<Task>,
    validation_tx: mpsc::Sender<Task>,
    upload_seq_tx: mpsc::Sender<Ticket>,
    validation_seq_tx: mpsc::Sender<Ticket>,
}

impl ExecutionQueue {
    pub fn new(
        pipeline: Arc<Pipeline>,
        status: Arc<SprintStatus>,
        settings: &SprintSettings,
    ) -> (Self, QueueReceivers) {
        let capacity = settings.execution_queue_size.max(1);
        let validation_capacity = settings.validator_queue_size.max(1);

        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (upload_seq_tx, upload_seq_rx) = mpsc::channel(capacity);
        let (validation_tx, validation_rx) = mpsc::channel(validation_capacity);
        let (validation_seq_tx, validation_seq_rx) = mpsc::channel(validation_capacity);

        (
            Self {
                pipeline,
                status,
                task_tx,
                validation_tx,
                upload_seq_tx,
                validation_seq_tx,
            },
            QueueReceivers {
                task_rx,
                validation_rx,
                upload_seq_rx,
                validation_seq_rx,
            },
        )
    }

    /// Submit a freshly claimed range. Blocks when the queue is full, which
    /// backpressures the execute loop. The ticket is enqueued before the task
    /// so the commit order is fixed at submission time.
    pub async fn add_task(&self, mut record: RangeRecord) -> bool {
        record.start_ts = Some(unix_now());
        let (done, ticket) = oneshot::channel();
        if self.upload_seq_tx.send(ticket).await.is_err() {
            return false;
        }
        self.task_tx
            .send(Task {
                record,
                lane: None,
                done,
            })
            .await
            .is_ok()
    }

    /// Submit a leased range for re-execution on a validator lane.
    pub async fn add_validation_task(&self, record: RangeRecord, lane: usize) -> bool {
        let (done, ticket) = oneshot::channel();
        if self.validation_seq_tx.send(ticket).await.is_err() {
            return false;
        }
        self.validation_tx
            .send(Task {
                record,
                lane: Some(lane),
                done,
            })
            .await
            .is_ok()
    }

    /// Free validation queue slots, checked before leasing more work.
    pub fn validation_headroom(&self) -> usize {
        self.validation_tx.capacity()
    }

    /// Ingestion tasks currently buffered, reported by the status loop.
    pub fn task_queue_depth(&self) -> usize {
        self.task_tx.max_capacity() - self.task_tx.capacity()
    }

    /// Validation tasks currently buffered, reported by the status loop.
    pub fn validation_queue_depth(&self) -> usize {
        self.validation_tx.max_capacity() - self.validation_tx.capacity()
    }

    /// Run the worker pool and both commit drains until cancelled.
    pub async fn run(&self, receivers: QueueReceivers, workers: usize, cancel: CancellationToken) {
        let task_rx: SharedTaskRx = Arc::new(Mutex::new(receivers.task_rx));
        let validation_rx: SharedTaskRx = Arc::new(Mutex::new(receivers.validation_rx));

        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let pipeline = Arc::clone(&self.pipeline);
            let task_rx = Arc::clone(&task_rx);
            let validation_rx = Arc::clone(&validation_rx);
            let cancel = cancel.clone();
            set.spawn(async move {
                worker_loop(pipeline, task_rx, validation_rx, cancel).await;
            });
        }

        {
            let pipeline = Arc::clone(&self.pipeline);
            let status = Arc::clone(&self.status);
            let cancel = cancel.clone();
            set.spawn(async move {
                drain_uploads(pipeline, status, receivers.upload_seq_rx, cancel).await;
            });
        }
        {
            let pipeline = Arc::clone(&self.pipeline);
            let status = Arc::clone(&self.status);
            let cancel = cancel.clone();
            set.spawn(async move {
                drain_validations(pipeline, status, receivers.validation_seq_rx, cancel).await;
            });
        }

        while set.join_next().await.is_some() {}
    }
}

async fn recv_task(rx: &SharedTaskRx) -> Option<Task> {
    rx.lock().await.recv().await
}

async fn worker_loop(
    pipeline: Arc<Pipeline>,
    task_rx: SharedTaskRx,
    validation_rx: SharedTaskRx,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = recv_task(&task_rx) => task,
            task = recv_task(&validation_rx) => task,
        };
        let task = match task {
            Some(task) => task,
            None => break,
        };
        if let Some(batch) = pipeline.gather(task.record, task.lane, &cancel).await {
            // The drain may have shut down already; nothing left to do then.
            let _ = task.done.send(batch);
        }
    }
}

async fn next_batch(
    seq_rx: &mut mpsc::Receiver<Ticket>,
    cancel: &CancellationToken,
) -> Option<EventBatch> {
    loop {
        let mut ticket = tokio::select! {
            _ = cancel.cancelled() => return None,
            ticket = seq_rx.recv() => ticket?,
        };
        tokio::select! {
            _ = cancel.cancelled() => return None,
            batch = &mut ticket => match batch {
                Ok(batch) => return Some(batch),
                // Worker dropped the ticket mid-shutdown; skip it.
                Err(_) => continue,
            },
        }
    }
}

async fn drain_uploads(
    pipeline: Arc<Pipeline>,
    status: Arc<SprintStatus>,
    mut seq_rx: mpsc::Receiver<Ticket>,
    cancel: CancellationToken,
) {
    while let Some(batch) = next_batch(&mut seq_rx, &cancel).await {
        loop {
            match pipeline.commit_ingested(&batch).await {
                Ok(record) => {
                    status.set_last_successful(record.end_block);
                    let duration_s = match (record.start_ts, record.end_ts) {
                        (Some(start), Some(end)) => end.saturating_sub(start) as f64,
                        _ => 0.0,
                    };
                    status.log_task_success(
                        record.start_block,
                        record.end_block,
                        duration_s,
                        batch.logs.len(),
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        start_block = batch.record.start_block,
                        end_block = batch.record.end_block,
                        error = %e,
                        "range commit failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(COMMIT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

async fn drain_validations(
    pipeline: Arc<Pipeline>,
    status: Arc<SprintStatus>,
    mut seq_rx: mpsc::Receiver<Ticket>,
    cancel: CancellationToken,
) {
    while let Some(batch) = next_batch(&mut seq_rx, &cancel).await {
        loop {
            match pipeline.commit_validated(&batch).await {
                Ok((record, reorg_detected)) => {
                    let lane = batch.lane.unwrap_or_default();
                    status.set_validator_progress(lane, record.end_block);
                    status.log_validation_success(
                        lane,
                        record.start_block,
                        record.end_block,
                        reorg_detected,
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        start_block = batch.record.start_block,
                        end_block = batch.record.end_block,
                        error = %e,
                        "validation commit failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(COMMIT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}
