//! Distributed coordination: prepare once, claim and process anywhere
//!
//! A two-phase protocol over a [`DistributedStateStore`]. `prepare`
//! materialises every record and the batch metadata up front; any number of
//! workers then loop on `process_worker_batch`, which atomically claims a
//! pending batch, runs it through the same record pipeline as the local
//! engine, and attempts the exactly-once job finalisation.
//!
//! Workers share no in-memory state; coordination happens exclusively
//! through the store's atomic operations.

use crate::config::EngineConfig;
use crate::events::{Event, EventBus, EventKind, EventPayload, JobSummary, SubscriptionId};
use crate::hooks::{LifecycleHooks, RecordProcessor, ValidateFn};
use crate::record::{RawRecord, ValidationOutcome};
use crate::pipeline::{BatchCounts, RecordPipeline};
use crate::source::{DataSource, Parser, RecordFeed};
use crate::splitter::{BatchSplitter, RecordStream};
use crate::store::{
    BatchMeta, BatchStateUpdate, BatchStatus, ClaimOutcome, ClaimRefusal, DistributedStateStore,
    JobConfigSnapshot, JobState, StateStore,
};
use crate::JobStatus;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Claims older than this are considered abandoned by default
const DEFAULT_STALE_BATCH_TIMEOUT: Duration = Duration::from_millis(900_000);

/// Result of the prepare phase
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub job_id: String,
    pub total_records: u64,
    pub total_batches: usize,
}

/// Result of one claim-and-process attempt
#[derive(Debug, Clone)]
pub struct WorkerBatchOutcome {
    pub claimed: bool,
    pub batch_id: Option<String>,
    pub batch_index: Option<usize>,
    pub processed_count: u64,
    pub failed_count: u64,
    /// True iff this call performed the exactly-once finalisation
    pub job_complete: bool,
    pub job_id: String,
}

/// Coordinator for multi-worker batch execution
pub struct DistributedCoordinator {
    config: EngineConfig,
    store: Arc<dyn DistributedStateStore>,
    events: Arc<EventBus>,
    validate: Option<Arc<ValidateFn>>,
    hooks: Arc<LifecycleHooks>,
    stale_batch_timeout: Duration,
}

impl DistributedCoordinator {
    pub fn new(config: EngineConfig, store: Arc<dyn DistributedStateStore>) -> Self {
        Self {
            config: config.normalized(),
            store,
            events: Arc::new(EventBus::new()),
            validate: None,
            hooks: Arc::new(LifecycleHooks::new()),
            stale_batch_timeout: DEFAULT_STALE_BATCH_TIMEOUT,
        }
    }

    /// Attach the synchronous validation function
    pub fn with_validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&RawRecord) -> ValidationOutcome + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Attach lifecycle hooks
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Override the stale-claim timeout
    pub fn with_stale_batch_timeout(mut self, timeout: Duration) -> Self {
        self.stale_batch_timeout = timeout;
        self
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe_any(handler)
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Materialise a job: stream the source, persist every batch's records,
    /// and create the job row with all batches `PENDING`
    pub async fn prepare(
        &self,
        source: Box<dyn DataSource>,
        parser: Box<dyn Parser>,
    ) -> Result<PrepareOutcome> {
        let job_id = Uuid::new_v4().to_string();
        let feed = RecordFeed::new(source, parser);
        let mut stream = RecordStream::new(feed, self.config.skip_empty_rows, None);
        let mut splitter = BatchSplitter::new(self.config.batch_size);

        let mut batches: Vec<BatchMeta> = Vec::new();
        let mut total_records = 0u64;
        while let Some(batch) = splitter.next_batch(&mut stream).await? {
            let batch_id = Uuid::new_v4().to_string();
            self.store
                .save_batch_records(&job_id, &batch_id, &batch.records)
                .await?;
            total_records += batch.records.len() as u64;
            debug!(job_id = %job_id, batch_index = batch.index, records = batch.records.len(), "batch prepared");
            batches.push(BatchMeta {
                id: batch_id,
                index: batch.index,
                status: BatchStatus::Pending,
                processed_count: 0,
                failed_count: 0,
            });
        }

        let total_batches = batches.len();
        let state = JobState {
            id: job_id.clone(),
            config: JobConfigSnapshot {
                batch_size: self.config.batch_size,
                continue_on_error: self.config.continue_on_error,
            },
            status: JobStatus::Processing,
            batches,
            total_records,
            started_at: Utc::now(),
            completed_at: None,
            distributed: true,
        };
        self.store.save_job_state(&state).await?;

        info!(job_id = %job_id, total_records, total_batches, "distributed job prepared");
        self.emit(
            &job_id,
            EventPayload::DistributedPrepared {
                total_records,
                total_batches,
            },
        );
        Ok(PrepareOutcome {
            job_id,
            total_records,
            total_batches,
        })
    }

    /// Claim one pending batch and process it; safe to call from any number
    /// of workers concurrently
    pub async fn process_worker_batch(
        &self,
        job_id: &str,
        processor: Arc<dyn RecordProcessor>,
        worker_id: &str,
    ) -> Result<WorkerBatchOutcome> {
        let reclaimed = self
            .store
            .reclaim_stale_batches(job_id, self.stale_batch_timeout)
            .await?;
        if reclaimed > 0 {
            warn!(job_id, reclaimed, "reclaimed stale batch claims");
        }

        let reservation = match self.store.claim_batch(job_id, worker_id).await? {
            ClaimOutcome::Claimed(reservation) => reservation,
            ClaimOutcome::NotClaimed(reason) => {
                debug!(job_id, worker_id, reason = %reason, "no batch claimed");
                // A worker that arrives after the last claim may still be the
                // one to observe all batches terminal.
                let job_complete = if reason == ClaimRefusal::NoPendingBatches {
                    self.finalize(job_id).await?
                } else {
                    false
                };
                return Ok(WorkerBatchOutcome {
                    claimed: false,
                    batch_id: None,
                    batch_index: None,
                    processed_count: 0,
                    failed_count: 0,
                    job_complete,
                    job_id: job_id.to_string(),
                });
            }
        };

        info!(
            job_id,
            worker_id,
            batch_index = reservation.batch_index,
            "batch claimed"
        );
        self.emit(
            job_id,
            EventPayload::BatchClaimed {
                batch_id: reservation.batch_id.clone(),
                batch_index: reservation.batch_index,
                worker_id: worker_id.to_string(),
            },
        );

        let total_records = self
            .store
            .get_job_state(job_id)
            .await?
            .map(|state| state.total_records)
            .unwrap_or(0);
        let mut records = self
            .store
            .get_batch_records(job_id, &reservation.batch_id)
            .await?;
        self.emit(
            job_id,
            EventPayload::BatchStarted {
                batch_id: reservation.batch_id.clone(),
                batch_index: reservation.batch_index,
                record_count: records.len(),
            },
        );

        let record_store: Arc<dyn StateStore> = self.store.clone();
        let pipeline = RecordPipeline {
            job_id: job_id.to_string(),
            config: self.config.clone(),
            validate: self.validate.clone(),
            hooks: self.hooks.clone(),
            events: self.events.clone(),
            store: record_store,
            cancel: CancellationToken::new(),
            gate: None,
            total_records_hint: total_records,
        };

        let mut counts = BatchCounts::default();
        let run = pipeline
            .run_batch(
                &reservation.batch_id,
                reservation.batch_index,
                &mut records,
                &processor,
                &mut counts,
            )
            .await;

        let status = match &run {
            Ok(()) => BatchStatus::Completed,
            Err(_) => BatchStatus::Failed,
        };
        self.store
            .update_batch_state(
                job_id,
                &reservation.batch_id,
                BatchStateUpdate {
                    status,
                    processed_count: counts.processed,
                    failed_count: counts.failed,
                },
            )
            .await?;

        match run {
            Ok(()) => {
                self.emit(
                    job_id,
                    EventPayload::BatchCompleted {
                        batch_id: reservation.batch_id.clone(),
                        batch_index: reservation.batch_index,
                        processed_count: counts.processed,
                        failed_count: counts.failed,
                    },
                );
            }
            Err(err) => {
                warn!(job_id, batch_index = reservation.batch_index, error = %err, "batch failed");
                self.emit(
                    job_id,
                    EventPayload::BatchFailed {
                        batch_id: reservation.batch_id.clone(),
                        batch_index: reservation.batch_index,
                        error: err.to_string(),
                    },
                );
            }
        }

        let job_complete = self.finalize(job_id).await?;
        Ok(WorkerBatchOutcome {
            claimed: true,
            batch_id: Some(reservation.batch_id),
            batch_index: Some(reservation.batch_index),
            processed_count: counts.processed,
            failed_count: counts.failed,
            job_complete,
            job_id: job_id.to_string(),
        })
    }

    /// Attempt the exactly-once finalisation; emits the terminal job event
    /// when this call wins the compare-and-set
    async fn finalize(&self, job_id: &str) -> Result<bool> {
        let Some(final_status) = self.store.try_finalize_job(job_id).await? else {
            return Ok(false);
        };
        match final_status {
            JobStatus::Failed => {
                warn!(job_id, "distributed job finalized as failed");
                self.emit(
                    job_id,
                    EventPayload::JobFailed {
                        error: "one or more batches failed".to_string(),
                    },
                );
            }
            _ => {
                let progress = self.store.get_progress(job_id).await?;
                info!(
                    job_id,
                    total = progress.total_records,
                    processed = progress.processed_records,
                    failed = progress.failed_records,
                    "distributed job completed"
                );
                self.emit(
                    job_id,
                    EventPayload::JobCompleted {
                        summary: JobSummary {
                            total: progress.total_records,
                            processed: progress.processed_records,
                            failed: progress.failed_records,
                            skipped: progress
                                .total_records
                                .saturating_sub(progress.processed_records + progress.failed_records),
                            elapsed_ms: progress.elapsed_ms,
                        },
                    },
                );
            }
        }
        Ok(true)
    }

    fn emit(&self, job_id: &str, payload: EventPayload) {
        self.events.emit(&Event::new(job_id, payload));
    }
}
