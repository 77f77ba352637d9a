//! The batch engine: lifecycle orchestration from `start` to a terminal state
//!
//! Drives the full record lifecycle: state transitions, streaming batch
//! execution with optional bounded concurrency, pause/resume/abort, chunked
//! execution for serverless callers, and crash-safe persistence through the
//! state-store port.
//!
//! # Example
//!
//! ```no_run
//! use accretion::{BatchEngine, EngineConfig, MemoryStore, processor_fn};
//! use std::sync::Arc;
//!
//! # use accretion::{DataSource, Parser, SourceChunk, RawRecord};
//! # use futures::stream::{BoxStream, StreamExt};
//! # struct MySource;
//! # #[async_trait::async_trait]
//! # impl DataSource for MySource {
//! #     fn read(self: Box<Self>) -> BoxStream<'static, anyhow::Result<SourceChunk>> {
//! #         futures::stream::empty().boxed()
//! #     }
//! # }
//! # struct MyParser;
//! # #[async_trait::async_trait]
//! # impl Parser for MyParser {
//! #     async fn parse(&mut self, _chunk: SourceChunk) -> anyhow::Result<Vec<RawRecord>> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let engine = BatchEngine::new(EngineConfig::default(), store);
//!
//! engine.from_source(Box::new(MySource), Box::new(MyParser));
//! engine.on(accretion::EventKind::JobProgress, |event| {
//!     println!("progress for {}", event.job_id);
//! });
//!
//! engine
//!     .start(Arc::new(processor_fn(|_record, _ctx| async { Ok(()) })))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ChunkLimits, EngineConfig};
use crate::context::JobContext;
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventKind, EventPayload, SubscriptionId};
use crate::hooks::{LifecycleHooks, RecordProcessor, ValidateFn};
use crate::record::{RawRecord, ProcessedRecord, ValidationOutcome};
use crate::source::{DataSource, Parser, RecordFeed};
use crate::splitter::{BatchSplitter, RecordBatch, RecordStream};
use crate::pipeline::{BatchCounts, RecordPipeline};
use crate::store::{BatchMeta, BatchStateUpdate, BatchStatus, JobProgress, StateStore};
use crate::JobStatus;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SourceWiring {
    source: Box<dyn DataSource>,
    parser: Box<dyn Parser>,
}

/// Result of one chunked-execution window
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    /// True iff the whole job completed within this chunk
    pub done: bool,
    /// Records processed by this chunk alone
    pub processed_records: u64,
    /// Records failed by this chunk alone
    pub failed_records: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub job_id: String,
}

/// Point-in-time view returned by [`BatchEngine::status`]
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub progress: JobProgress,
    pub batches: Vec<BatchMeta>,
}

/// The job execution engine
pub struct BatchEngine {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    ctx: Arc<JobContext>,
    wiring: Mutex<Option<SourceWiring>>,
    source_consumed: AtomicBool,
    validate: Option<Arc<ValidateFn>>,
    hooks: Arc<LifecycleHooks>,
}

impl BatchEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn StateStore>) -> Self {
        let config = config.normalized();
        let ctx = Arc::new(JobContext::new(config.clone()));
        Self {
            config,
            store,
            events: Arc::new(EventBus::new()),
            ctx,
            wiring: Mutex::new(None),
            source_consumed: AtomicBool::new(false),
            validate: None,
            hooks: Arc::new(LifecycleHooks::new()),
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

    /// Wire a source and parser; required before `start`, `process_chunk`,
    /// or `count`
    pub fn from_source(&self, source: Box<dyn DataSource>, parser: Box<dyn Parser>) {
        let mut wiring = lock(&self.wiring);
        *wiring = Some(SourceWiring { source, parser });
        self.source_consumed.store(false, Ordering::SeqCst);
    }

    pub fn job_id(&self) -> String {
        self.ctx.job_id().to_string()
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.events.unsubscribe(kind, id)
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe_any(handler)
    }

    pub fn off_any(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe_any(id)
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Stream the source and count records without mutating any job state
    ///
    /// Consumes the attached source.
    pub async fn count(&self) -> Result<u64> {
        let mut feed = self.take_feed()?;
        let mut total = 0u64;
        while feed.next().await?.is_some() {
            total += 1;
        }
        Ok(total)
    }

    /// Run the job to a terminal state (or to `PAUSED` on chunk exhaustion)
    ///
    /// Requires a wired source and status `CREATED`, `PREVIEWED`, or
    /// `PAUSED`.
    pub async fn start(&self, processor: Arc<dyn RecordProcessor>) -> Result<()> {
        if lock(&self.wiring).is_none() {
            return Err(self.missing_source_error().into());
        }
        self.ctx.transition_to(JobStatus::Processing)?;
        self.ctx.pause_latch().release();
        if let Err(err) = self.ctx.save_state(self.store.as_ref()).await {
            warn!(job_id = %self.ctx.job_id(), error = %err, "failed to persist initial job state");
        }

        // One cooperative yield so a handler registered on the same
        // scheduling step as the start call still sees the event.
        tokio::task::yield_now().await;
        self.emit(EventPayload::JobStarted);
        info!(job_id = %self.ctx.job_id(), batch_size = self.config.batch_size, "job started");

        let run = self.run_stream(processor).await;
        let result = self.finish_run(run);

        if let Err(err) = self.ctx.save_state(self.store.as_ref()).await {
            warn!(job_id = %self.ctx.job_id(), error = %err, "failed to persist final job state");
        }
        result
    }

    /// Map the stream outcome onto the termination edges
    fn finish_run(&self, run: Result<()>) -> Result<()> {
        match run {
            Ok(()) => {
                if self.ctx.cancel_token().is_cancelled()
                    || self.ctx.status() == JobStatus::Aborted
                {
                    return Ok(());
                }
                if self.ctx.chunk_exhausted() {
                    self.ctx.transition_to(JobStatus::Paused)?;
                    info!(job_id = %self.ctx.job_id(), "chunk exhausted, job paused");
                    return Ok(());
                }
                self.ctx.transition_to(JobStatus::Completed)?;
                self.ctx.set_completed_now();
                let summary = self.ctx.summary();
                info!(
                    job_id = %self.ctx.job_id(),
                    total = summary.total,
                    processed = summary.processed,
                    failed = summary.failed,
                    elapsed_ms = summary.elapsed_ms,
                    "job completed"
                );
                self.emit(EventPayload::JobCompleted { summary });
                Ok(())
            }
            Err(err) => {
                if self.ctx.status() == JobStatus::Aborted {
                    debug!(job_id = %self.ctx.job_id(), error = %err, "error after abort, ignored");
                    return Ok(());
                }
                if let Err(transition_err) = self.ctx.transition_to(JobStatus::Failed) {
                    warn!(job_id = %self.ctx.job_id(), error = %transition_err, "could not mark job failed");
                }
                self.ctx.set_completed_now();
                warn!(job_id = %self.ctx.job_id(), error = %err, "job failed");
                self.emit(EventPayload::JobFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_stream(&self, processor: Arc<dyn RecordProcessor>) -> Result<()> {
        let feed = self.take_feed()?;
        let mut stream = RecordStream::new(feed, false, Some(self.ctx.clone()));
        let mut splitter = BatchSplitter::new(self.config.batch_size);
        let pipeline = Arc::new(RecordPipeline {
            job_id: self.ctx.job_id().to_string(),
            config: self.config.clone(),
            validate: self.validate.clone(),
            hooks: self.hooks.clone(),
            events: self.events.clone(),
            store: self.store.clone(),
            cancel: self.ctx.cancel_token().clone(),
            gate: Some(self.ctx.clone()),
            total_records_hint: 0,
        });

        if self.config.max_concurrent_batches <= 1 {
            self.run_sequential(&mut stream, &mut splitter, &pipeline, &processor)
                .await
        } else {
            self.run_concurrent(&mut stream, &mut splitter, &pipeline, &processor)
                .await
        }
    }

    /// Strict sequential execution; chunk exhaustion is checked after each
    /// completed batch
    async fn run_sequential(
        &self,
        stream: &mut RecordStream,
        splitter: &mut BatchSplitter,
        pipeline: &Arc<RecordPipeline<dyn StateStore>>,
        processor: &Arc<dyn RecordProcessor>,
    ) -> Result<()> {
        while let Some(batch) = splitter.next_batch(stream).await? {
            if self.ctx.cancel_token().is_cancelled() {
                break;
            }
            if self.ctx.is_batch_completed(batch.index) {
                debug!(job_id = %self.ctx.job_id(), batch_index = batch.index, "skipping restored batch");
                continue;
            }
            self.execute_batch(batch, pipeline.clone(), processor.clone())
                .await?;
            if self.ctx.is_chunk_exhausted() {
                self.ctx.mark_chunk_exhausted();
                break;
            }
        }
        Ok(())
    }

    /// Bounded concurrent execution; completion order across batches is
    /// unspecified, record order within a batch is preserved
    async fn run_concurrent(
        &self,
        stream: &mut RecordStream,
        splitter: &mut BatchSplitter,
        pipeline: &Arc<RecordPipeline<dyn StateStore>>,
        processor: &Arc<dyn RecordProcessor>,
    ) -> Result<()> {
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<()>>> = FuturesUnordered::new();

        while let Some(batch) = splitter.next_batch(stream).await? {
            if self.ctx.cancel_token().is_cancelled() {
                break;
            }
            if self.ctx.is_batch_completed(batch.index) {
                debug!(job_id = %self.ctx.job_id(), batch_index = batch.index, "skipping restored batch");
                continue;
            }
            if in_flight.len() >= self.config.max_concurrent_batches {
                if let Some(done) = in_flight.next().await {
                    done?;
                }
            }
            in_flight.push(Box::pin(self.execute_batch(
                batch,
                pipeline.clone(),
                processor.clone(),
            )));
            if self.ctx.is_chunk_exhausted() {
                self.ctx.mark_chunk_exhausted();
                break;
            }
        }

        while let Some(done) = in_flight.next().await {
            done?;
        }
        Ok(())
    }

    async fn execute_batch(
        &self,
        mut batch: RecordBatch,
        pipeline: Arc<RecordPipeline<dyn StateStore>>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<()> {
        let batch_id = Uuid::new_v4().to_string();
        let batch_index = batch.index;
        let job_id = self.ctx.job_id().to_string();

        self.ctx.register_batch(&batch_id, batch_index);
        self.store
            .update_batch_state(
                &job_id,
                &batch_id,
                BatchStateUpdate {
                    status: BatchStatus::Processing,
                    processed_count: 0,
                    failed_count: 0,
                },
            )
            .await?;
        self.emit(EventPayload::BatchStarted {
            batch_id: batch_id.clone(),
            batch_index,
            record_count: batch.records.len(),
        });

        let mut counts = BatchCounts::default();
        pipeline
            .run_batch(
                &batch_id,
                batch_index,
                &mut batch.records,
                &processor,
                &mut counts,
            )
            .await?;

        if self.ctx.cancel_token().is_cancelled() {
            // aborted mid-batch: no further lifecycle events for this batch
            return Ok(());
        }

        self.ctx
            .complete_batch(&batch_id, counts.processed, counts.failed);
        self.store
            .update_batch_state(
                &job_id,
                &batch_id,
                BatchStateUpdate {
                    status: BatchStatus::Completed,
                    processed_count: counts.processed,
                    failed_count: counts.failed,
                },
            )
            .await?;
        // release the in-memory record slice; only counts remain
        batch.records = Vec::new();

        debug!(job_id = %job_id, batch_index, processed = counts.processed, failed = counts.failed, "batch completed");
        self.emit(EventPayload::BatchCompleted {
            batch_id,
            batch_index,
            processed_count: counts.processed,
            failed_count: counts.failed,
        });
        self.emit(EventPayload::JobProgress {
            progress: self.ctx.progress(),
        });
        self.ctx.save_state(self.store.as_ref()).await?;
        Ok(())
    }

    /// Run one chunked-execution window
    ///
    /// Chunk boundaries are at batch granularity: the current batch always
    /// completes before the chunk halts. The job transitions to `PAUSED`
    /// when a limit trips mid-stream and can be resumed with `restore` +
    /// another `process_chunk` call.
    pub async fn process_chunk(
        &self,
        processor: Arc<dyn RecordProcessor>,
        limits: Option<ChunkLimits>,
    ) -> Result<ChunkOutcome> {
        if let Some(limits) = &limits {
            limits.validate()?;
        }
        self.ctx.begin_chunk(limits);
        let (base_processed, base_failed) = self.ctx.counts();

        let run_error = match self.start(processor).await {
            Ok(()) => None,
            // configuration failure: the chunk never ran
            Err(err) if err.downcast_ref::<EngineError>().is_some() => return Err(err),
            Err(err) => Some(err),
        };

        let (processed, failed) = self.ctx.counts();
        let outcome = ChunkOutcome {
            done: self.ctx.status() == JobStatus::Completed,
            processed_records: processed - base_processed,
            failed_records: failed - base_failed,
            total_processed: processed,
            total_failed: failed,
            job_id: self.ctx.job_id().to_string(),
        };
        self.emit(EventPayload::ChunkCompleted {
            done: outcome.done,
            processed_records: outcome.processed_records,
            failed_records: outcome.failed_records,
        });
        match run_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Pause a running job at the next suspension point
    pub fn pause(&self) -> Result<(), EngineError> {
        self.ctx.transition_to(JobStatus::Paused)?;
        self.ctx.pause_latch().engage();
        info!(job_id = %self.ctx.job_id(), "job paused");
        self.emit(EventPayload::JobPaused);
        Ok(())
    }

    /// Resume a paused job
    pub fn resume(&self) -> Result<(), EngineError> {
        match self.ctx.status() {
            JobStatus::Aborted => Err(EngineError::CannotResumeAborted),
            JobStatus::Paused => {
                self.ctx.transition_to(JobStatus::Processing)?;
                self.ctx.pause_latch().release();
                info!(job_id = %self.ctx.job_id(), "job resumed");
                Ok(())
            }
            status => Err(EngineError::InvalidTransition {
                from: status,
                to: JobStatus::Processing,
            }),
        }
    }

    /// Abort a running or paused job
    ///
    /// Records in flight may still finish their current processor call; the
    /// scheduler stops at the next suspension point.
    pub fn abort(&self) -> Result<(), EngineError> {
        self.ctx.transition_to(JobStatus::Aborted)?;
        self.ctx.cancel_token().cancel();
        self.ctx.pause_latch().release();
        self.ctx.set_completed_now();
        info!(job_id = %self.ctx.job_id(), "job aborted");
        self.emit(EventPayload::JobAborted);
        Ok(())
    }

    /// Current status, progress, and batch list
    pub fn status(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.ctx.status(),
            progress: self.ctx.progress(),
            batches: self.ctx.batches(),
        }
    }

    pub fn job_status(&self) -> JobStatus {
        self.ctx.status()
    }

    /// Records whose status is `invalid` or `failed`
    pub async fn failed_records(&self) -> Result<Vec<ProcessedRecord>> {
        self.store.get_failed_records(self.ctx.job_id()).await
    }

    /// Records not yet terminal; empty in streaming mode
    pub async fn pending_records(&self) -> Result<Vec<ProcessedRecord>> {
        self.store.get_pending_records(self.ctx.job_id()).await
    }

    /// Rebuild an engine from persisted state, positioned to resume
    ///
    /// Returns `None` when the job id is unknown. The caller must re-attach
    /// a source and parser before calling `start` or `process_chunk`;
    /// batches already completed are never re-run. The persisted
    /// `batch_size` wins over the one in `config` so batch boundaries
    /// reproduce on the replayed stream.
    pub async fn restore(
        job_id: &str,
        config: EngineConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Option<Self>> {
        let Some(state) = store.get_job_state(job_id).await? else {
            return Ok(None);
        };
        let mut config = config.normalized();
        config.batch_size = state.config.batch_size;
        let ctx = Arc::new(JobContext::restored(&state, config.clone()));
        info!(
            job_id,
            total_records = state.total_records,
            completed_batches = state
                .batches
                .iter()
                .filter(|b| b.status == BatchStatus::Completed)
                .count(),
            "job restored"
        );
        Ok(Some(Self {
            config,
            store,
            events: Arc::new(EventBus::new()),
            ctx,
            wiring: Mutex::new(None),
            source_consumed: AtomicBool::new(false),
            validate: None,
            hooks: Arc::new(LifecycleHooks::new()),
        }))
    }

    fn take_feed(&self) -> Result<RecordFeed, EngineError> {
        let wiring = lock(&self.wiring)
            .take()
            .ok_or_else(|| self.missing_source_error())?;
        self.source_consumed.store(true, Ordering::SeqCst);
        Ok(RecordFeed::new(wiring.source, wiring.parser))
    }

    fn missing_source_error(&self) -> EngineError {
        if self.source_consumed.load(Ordering::SeqCst) {
            EngineError::SourceConsumed
        } else {
            EngineError::SourceNotConfigured
        }
    }

    fn emit(&self, payload: EventPayload) {
        self.events
            .emit(&Event::new(self.ctx.job_id(), payload));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
