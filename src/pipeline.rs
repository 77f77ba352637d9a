//! The per-record pipeline: validate, hooks, process with retry
//!
//! One pipeline instance drives all records of a batch in index order. The
//! same pipeline runs under the local scheduler (with a job context as the
//! pause/chunk gate) and under a distributed worker (no gate, own cancel
//! token), so claim-and-process reuses exactly the record semantics of
//! `start`.
//!
//! Stage failures are routed, not thrown: a validation hard error or a hook
//! failure marks the record, persists it, emits `record:failed`, and either
//! continues (`continue_on_error`) or stops the job. Only processor failures
//! are retried.

use crate::config::EngineConfig;
use crate::context::JobContext;
use crate::events::{Event, EventBus, EventPayload};
use crate::hooks::{LifecycleHooks, ProcessingContext, RecordProcessor, ValidateFn};
use crate::record::{is_empty_row, ProcessedRecord, RecordStatus};
use crate::store::StateStore;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Processed/failed tallies for one batch run
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchCounts {
    pub processed: u64,
    pub failed: u64,
}

pub(crate) struct RecordPipeline<S: ?Sized> {
    pub job_id: String,
    pub config: EngineConfig,
    pub validate: Option<Arc<ValidateFn>>,
    pub hooks: Arc<LifecycleHooks>,
    pub events: Arc<EventBus>,
    pub store: Arc<S>,
    pub cancel: CancellationToken,
    /// Local-engine integration: pause latch, chunk counting, job counters.
    /// Absent under a distributed worker.
    pub gate: Option<Arc<JobContext>>,
    /// Record total reported to processors when no gate is attached
    pub total_records_hint: u64,
}

impl<S: StateStore + ?Sized> RecordPipeline<S> {
    /// Run every record of a batch through the pipeline, in index order
    ///
    /// `counts` is accurate even when the run stops early with an error.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        batch_index: usize,
        records: &mut [ProcessedRecord],
        processor: &Arc<dyn RecordProcessor>,
        counts: &mut BatchCounts,
    ) -> Result<()> {
        for record in records.iter_mut() {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(ctx) = &self.gate {
                ctx.pause_latch().wait_ready().await;
            }
            if self.config.skip_empty_rows && is_empty_row(&record.raw) {
                continue;
            }

            let pctx = self.processing_context(batch_id, batch_index, record.index);
            let outcome = self.run_record(record, processor, &pctx, counts).await;
            if let Some(ctx) = &self.gate {
                ctx.bump_chunk_record();
            }
            outcome?;
        }
        Ok(())
    }

    async fn run_record(
        &self,
        record: &mut ProcessedRecord,
        processor: &Arc<dyn RecordProcessor>,
        pctx: &ProcessingContext,
        counts: &mut BatchCounts,
    ) -> Result<()> {
        if let Some(validate) = &self.validate {
            if let Some(hook) = &self.hooks.before_validate {
                if let Err(err) = hook(record.clone(), pctx.clone()).await {
                    let message = format!("beforeValidate hook failed: {}", err);
                    return self.record_failure(record, message, pctx, counts).await;
                }
            }

            let outcome = validate(&record.raw);
            record.errors = outcome.errors;
            if outcome.parsed.is_some() {
                record.parsed = outcome.parsed;
            }
            record.status = if record.has_hard_errors() {
                RecordStatus::Invalid
            } else {
                RecordStatus::Valid
            };

            // Runs even for invalid records; its returned error list is
            // authoritative and may upgrade or downgrade the verdict.
            if let Some(hook) = &self.hooks.after_validate {
                match hook(record.clone(), pctx.clone()).await {
                    Ok(returned) => {
                        record.errors = returned.errors;
                        if returned.parsed.is_some() {
                            record.parsed = returned.parsed;
                        }
                        record.status = if record.has_hard_errors() {
                            RecordStatus::Invalid
                        } else {
                            RecordStatus::Valid
                        };
                    }
                    Err(err) => {
                        let message = format!("afterValidate hook failed: {}", err);
                        return self.record_failure(record, message, pctx, counts).await;
                    }
                }
            }

            if record.has_hard_errors() {
                record.status = RecordStatus::Invalid;
                self.save(record, pctx).await?;
                self.on_failed(counts);
                let message = record
                    .first_hard_error()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .unwrap_or_else(|| "validation failed".to_string());
                debug!(job_id = %self.job_id, record_index = record.index, %message, "record failed validation");
                self.emit(EventPayload::RecordFailed {
                    record_index: record.index,
                    error: message.clone(),
                });
                if !self.config.continue_on_error {
                    return Err(anyhow!("record {} failed validation: {}", record.index, message));
                }
                return Ok(());
            }
            // warnings, if any, stay on the valid record
        }

        if let Some(hook) = &self.hooks.before_process {
            if let Err(err) = hook(record.clone(), pctx.clone()).await {
                let message = format!("beforeProcess hook failed: {}", err);
                return self.record_failure(record, message, pctx, counts).await;
            }
        }

        let max_attempts = 1 + self.config.max_retries;
        let mut attempt = 1u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match processor.process(record, pctx).await {
                Ok(()) => {
                    record.status = RecordStatus::Processed;
                    record.retry_count = attempt - 1;
                    record.processing_error = None;
                    self.save(record, pctx).await?;
                    self.on_processed(counts);
                    self.emit(EventPayload::RecordProcessed {
                        record_index: record.index,
                    });

                    if let Some(hook) = &self.hooks.after_process {
                        if let Err(err) = hook(record.clone(), pctx.clone()).await {
                            self.revert_processed(counts);
                            let message = format!("afterProcess hook failed: {}", err);
                            return self.record_failure(record, message, pctx, counts).await;
                        }
                    }
                    return Ok(());
                }
                Err(err) if attempt < max_attempts => {
                    self.emit(EventPayload::RecordRetried {
                        record_index: record.index,
                        attempt,
                        error: err.to_string(),
                    });
                    let backoff = self.config.retry_delay * (1u32 << (attempt - 1).min(16));
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    if let Some(ctx) = &self.gate {
                        ctx.pause_latch().wait_ready().await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    record.status = RecordStatus::Failed;
                    record.processing_error = Some(err.to_string());
                    record.retry_count = self.config.max_retries;
                    self.save(record, pctx).await?;
                    self.on_failed(counts);
                    debug!(job_id = %self.job_id, record_index = record.index, error = %err, "record failed after retries");
                    self.emit(EventPayload::RecordFailed {
                        record_index: record.index,
                        error: err.to_string(),
                    });
                    if !self.config.continue_on_error {
                        return Err(err);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Hook-stage failure: mark, persist, emit, honour `continue_on_error`
    async fn record_failure(
        &self,
        record: &mut ProcessedRecord,
        message: String,
        pctx: &ProcessingContext,
        counts: &mut BatchCounts,
    ) -> Result<()> {
        record.status = RecordStatus::Failed;
        record.processing_error = Some(message.clone());
        self.save(record, pctx).await?;
        self.on_failed(counts);
        debug!(job_id = %self.job_id, record_index = record.index, %message, "record failed");
        self.emit(EventPayload::RecordFailed {
            record_index: record.index,
            error: message.clone(),
        });
        if !self.config.continue_on_error {
            return Err(anyhow!(message));
        }
        Ok(())
    }

    fn processing_context(
        &self,
        batch_id: &str,
        batch_index: usize,
        record_index: u64,
    ) -> ProcessingContext {
        let total_records = self
            .gate
            .as_ref()
            .map(|ctx| ctx.total_records())
            .unwrap_or(self.total_records_hint);
        ProcessingContext {
            job_id: self.job_id.clone(),
            batch_id: batch_id.to_string(),
            batch_index,
            record_index,
            total_records,
            cancel: self.cancel.child_token(),
        }
    }

    async fn save(&self, record: &ProcessedRecord, pctx: &ProcessingContext) -> Result<()> {
        self.store
            .save_processed_record(&self.job_id, &pctx.batch_id, record)
            .await
    }

    fn on_processed(&self, counts: &mut BatchCounts) {
        counts.processed += 1;
        if let Some(ctx) = &self.gate {
            ctx.record_processed();
        }
    }

    fn revert_processed(&self, counts: &mut BatchCounts) {
        counts.processed = counts.processed.saturating_sub(1);
        if let Some(ctx) = &self.gate {
            ctx.revert_processed();
        }
    }

    fn on_failed(&self, counts: &mut BatchCounts) {
        counts.failed += 1;
        if let Some(ctx) = &self.gate {
            ctx.record_failed();
        }
    }

    fn emit(&self, payload: EventPayload) {
        self.events.emit(&Event::new(&self.job_id, payload));
    }
}
