//! Job context: the engine's single mutable aggregate
//!
//! Holds job identity, the status cell guarded by the transition table, the
//! batch table, counters, chunk bookkeeping, the pause latch, and the cancel
//! token. Counters are atomics and the batch table sits behind a mutex that
//! is never held across an await, so the context stays consistent when
//! `max_concurrent_batches > 1` keeps several batch futures in flight.

use crate::config::{ChunkLimits, EngineConfig};
use crate::error::EngineError;
use crate::events::JobSummary;
use crate::store::{BatchMeta, BatchStatus, JobProgress, JobState, StateStore};
use crate::JobStatus;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// One-shot awaitable gating the scheduler's suspension points
///
/// Engaged on `pause`, released on `resume` or `abort`. Waiters suspend
/// while the latch is engaged and wake on release.
pub(crate) struct PauseLatch {
    gate: watch::Sender<bool>,
}

impl PauseLatch {
    fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self { gate }
    }

    pub fn engage(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Suspend until the latch is released; returns immediately when open
    pub async fn wait_ready(&self) {
        let mut rx = self.gate.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct BatchTable {
    batches: Vec<BatchMeta>,
    by_id: HashMap<String, usize>,
    completed_indices: HashSet<usize>,
}

struct ChunkControl {
    limits: Option<ChunkLimits>,
    started: Instant,
    exhausted: bool,
}

pub(crate) struct JobContext {
    job_id: String,
    config: EngineConfig,
    status: Mutex<JobStatus>,
    table: Mutex<BatchTable>,
    total_records: AtomicU64,
    processed_count: AtomicU64,
    failed_count: AtomicU64,
    chunk_record_count: AtomicU64,
    chunk_active: AtomicBool,
    chunk: Mutex<ChunkControl>,
    started_at: DateTime<Utc>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    pause: PauseLatch,
}

impl JobContext {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            Uuid::new_v4().to_string(),
            config,
            JobStatus::Created,
            Vec::new(),
            0,
            Utc::now(),
        )
    }

    /// Rebuild a context from a persisted snapshot for resumption
    ///
    /// Completed batches contribute their counts once and their indices go
    /// into the skip set; status resets to `CREATED` so `start` is callable
    /// again.
    pub fn restored(state: &JobState, config: EngineConfig) -> Self {
        let ctx = Self::with_parts(
            state.id.clone(),
            config,
            JobStatus::Created,
            state.batches.clone(),
            state.total_records,
            state.started_at,
        );
        let completed = state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed);
        {
            let mut table = ctx.lock_table();
            for batch in completed.clone() {
                table.completed_indices.insert(batch.index);
            }
        }
        for batch in completed {
            ctx.processed_count
                .fetch_add(batch.processed_count, Ordering::SeqCst);
            ctx.failed_count
                .fetch_add(batch.failed_count, Ordering::SeqCst);
        }
        ctx
    }

    fn with_parts(
        job_id: String,
        config: EngineConfig,
        status: JobStatus,
        batches: Vec<BatchMeta>,
        total_records: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        let by_id = batches
            .iter()
            .enumerate()
            .map(|(pos, b)| (b.id.clone(), pos))
            .collect();
        Self {
            job_id,
            config,
            status: Mutex::new(status),
            table: Mutex::new(BatchTable {
                batches,
                by_id,
                completed_indices: HashSet::new(),
            }),
            total_records: AtomicU64::new(total_records),
            processed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            chunk_record_count: AtomicU64::new(0),
            chunk_active: AtomicBool::new(false),
            chunk: Mutex::new(ChunkControl {
                limits: None,
                started: Instant::now(),
                exhausted: false,
            }),
            started_at,
            completed_at: Mutex::new(None),
            cancel: CancellationToken::new(),
            pause: PauseLatch::new(),
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, BatchTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        match self.status.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Validate and apply a state-machine edge
    pub fn transition_to(&self, next: JobStatus) -> Result<(), EngineError> {
        let mut status = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: *status,
                to: next,
            });
        }
        debug!(job_id = %self.job_id, from = %status, to = %next, "job state transition");
        *status = next;
        Ok(())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pause_latch(&self) -> &PauseLatch {
        &self.pause
    }

    pub fn set_completed_now(&self) {
        if let Ok(mut guard) = self.completed_at.lock() {
            *guard = Some(Utc::now());
        }
    }

    // --- record counters -------------------------------------------------

    /// Track the highest record index seen; on a replayed (restored) stream
    /// the total only grows past what was already persisted
    pub fn observe_record(&self, index: u64) {
        self.total_records.fetch_max(index + 1, Ordering::SeqCst);
    }

    pub fn total_records(&self) -> u64 {
        self.total_records.load(Ordering::SeqCst)
    }

    pub fn record_processed(&self) {
        self.processed_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn revert_processed(&self) {
        self.processed_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed_count.fetch_add(1, Ordering::SeqCst);
    }

    /// `(processed, failed)` snapshot
    pub fn counts(&self) -> (u64, u64) {
        (
            self.processed_count.load(Ordering::SeqCst),
            self.failed_count.load(Ordering::SeqCst),
        )
    }

    // --- batch table -----------------------------------------------------

    /// Register a batch as it starts processing
    ///
    /// The list stays ordered by batch index even when concurrent batch
    /// futures register out of dispatch order, so `batches[i].index == i`
    /// holds at every persistence point. Re-registering an index (a restored
    /// batch that was in flight at the crash) replaces the old entry under
    /// the fresh id.
    pub fn register_batch(&self, batch_id: &str, index: usize) {
        let mut table = self.lock_table();
        let meta = BatchMeta {
            id: batch_id.to_string(),
            index,
            status: BatchStatus::Processing,
            processed_count: 0,
            failed_count: 0,
        };
        match table.batches.iter().position(|b| b.index == index) {
            Some(pos) => {
                let old_id = table.batches[pos].id.clone();
                table.by_id.remove(&old_id);
                table.by_id.insert(batch_id.to_string(), pos);
                table.batches[pos] = meta;
            }
            None => {
                let pos = table
                    .batches
                    .iter()
                    .position(|b| b.index > index)
                    .unwrap_or(table.batches.len());
                table.batches.insert(pos, meta);
                table.by_id = table
                    .batches
                    .iter()
                    .enumerate()
                    .map(|(p, b)| (b.id.clone(), p))
                    .collect();
            }
        }
    }

    pub fn complete_batch(&self, batch_id: &str, processed: u64, failed: u64) {
        let mut table = self.lock_table();
        let Some(pos) = table.by_id.get(batch_id).copied() else {
            return;
        };
        let batch = &mut table.batches[pos];
        batch.status = BatchStatus::Completed;
        batch.processed_count = processed;
        batch.failed_count = failed;
        let index = batch.index;
        table.completed_indices.insert(index);
    }

    pub fn is_batch_completed(&self, index: usize) -> bool {
        self.lock_table().completed_indices.contains(&index)
    }

    pub fn batches(&self) -> Vec<BatchMeta> {
        self.lock_table().batches.clone()
    }

    // --- chunk bookkeeping -----------------------------------------------

    /// Open a chunked-execution window; counting is active only when limits
    /// are present
    pub fn begin_chunk(&self, limits: Option<ChunkLimits>) {
        self.chunk_record_count.store(0, Ordering::SeqCst);
        self.chunk_active.store(limits.is_some(), Ordering::SeqCst);
        if let Ok(mut chunk) = self.chunk.lock() {
            chunk.limits = limits;
            chunk.started = Instant::now();
            chunk.exhausted = false;
        }
    }

    pub fn bump_chunk_record(&self) {
        if self.chunk_active.load(Ordering::SeqCst) {
            self.chunk_record_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// True iff chunk limits are set and either has tripped
    pub fn is_chunk_exhausted(&self) -> bool {
        let chunk = match self.chunk.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(limits) = chunk.limits else {
            return false;
        };
        if let Some(max_records) = limits.max_records {
            if self.chunk_record_count.load(Ordering::SeqCst) >= max_records {
                return true;
            }
        }
        if let Some(max_duration) = limits.max_duration {
            if chunk.started.elapsed() >= max_duration {
                return true;
            }
        }
        false
    }

    pub fn mark_chunk_exhausted(&self) {
        if let Ok(mut chunk) = self.chunk.lock() {
            chunk.exhausted = true;
        }
    }

    pub fn chunk_exhausted(&self) -> bool {
        match self.chunk.lock() {
            Ok(guard) => guard.exhausted,
            Err(poisoned) => poisoned.into_inner().exhausted,
        }
    }

    // --- snapshots -------------------------------------------------------

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn progress(&self) -> JobProgress {
        let total = self.total_records();
        let (processed, failed) = self.counts();
        let table = self.lock_table();
        JobProgress {
            total_records: total,
            processed_records: processed,
            failed_records: failed,
            pending_records: total.saturating_sub(processed + failed),
            percentage: JobProgress::percent(processed + failed, total),
            current_batch: table.completed_indices.len(),
            total_batches: table.batches.len(),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        let total = self.total_records();
        let (processed, failed) = self.counts();
        JobSummary {
            total,
            processed,
            failed,
            skipped: total.saturating_sub(processed + failed),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Serialise the job state (without in-flight record slices) to the store
    pub async fn save_state(&self, store: &dyn StateStore) -> anyhow::Result<()> {
        let completed_at = match self.completed_at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let state = JobState {
            id: self.job_id.clone(),
            config: self.config.snapshot(),
            status: self.status(),
            batches: self.batches(),
            total_records: self.total_records(),
            started_at: self.started_at,
            completed_at,
            distributed: false,
        };
        store.save_job_state(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> JobContext {
        JobContext::new(EngineConfig::default())
    }

    #[test]
    fn test_transition_table() {
        let ctx = context();
        assert_eq!(ctx.status(), JobStatus::Created);

        ctx.transition_to(JobStatus::Processing).unwrap();
        ctx.transition_to(JobStatus::Paused).unwrap();
        ctx.transition_to(JobStatus::Processing).unwrap();
        ctx.transition_to(JobStatus::Completed).unwrap();

        let err = ctx.transition_to(JobStatus::Processing).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Processing,
            }
        );
    }

    #[test]
    fn test_observe_record_is_running_max() {
        let ctx = context();
        ctx.observe_record(0);
        ctx.observe_record(1);
        assert_eq!(ctx.total_records(), 2);

        // replayed stream after a restore never shrinks the total
        ctx.observe_record(0);
        assert_eq!(ctx.total_records(), 2);
    }

    #[test]
    fn test_batch_register_upserts_by_index() {
        let ctx = context();
        ctx.register_batch("b-old", 0);
        ctx.register_batch("b-new", 0);

        let batches = ctx.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].id, "b-new");
        assert_eq!(batches[0].index, 0);
    }

    #[test]
    fn test_batch_table_sorted_under_out_of_order_registration() {
        let ctx = context();
        ctx.register_batch("b2", 2);
        ctx.register_batch("b0", 0);
        ctx.register_batch("b1", 1);
        ctx.complete_batch("b1", 9, 1);

        let batches = ctx.batches();
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i);
        }
        assert_eq!(batches[1].status, BatchStatus::Completed);
        assert_eq!(batches[1].processed_count, 9);
        assert!(ctx.is_batch_completed(1));
        assert!(!ctx.is_batch_completed(0));
    }

    #[test]
    fn test_chunk_exhaustion_by_records() {
        let ctx = context();
        assert!(!ctx.is_chunk_exhausted(), "no limits, never exhausted");

        ctx.begin_chunk(Some(ChunkLimits {
            max_records: Some(2),
            max_duration: None,
        }));
        ctx.bump_chunk_record();
        assert!(!ctx.is_chunk_exhausted());
        ctx.bump_chunk_record();
        assert!(ctx.is_chunk_exhausted());
    }

    #[test]
    fn test_chunk_count_inactive_without_limits() {
        let ctx = context();
        ctx.begin_chunk(None);
        ctx.bump_chunk_record();
        assert_eq!(ctx.chunk_record_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_latch_gates_waiters_until_release() {
        let ctx = context();

        // open latch: ready immediately
        let mut open = tokio_test::task::spawn(ctx.pause_latch().wait_ready());
        assert!(open.poll().is_ready());
        drop(open);

        ctx.pause_latch().engage();
        let mut waiting = tokio_test::task::spawn(ctx.pause_latch().wait_ready());
        assert!(waiting.poll().is_pending(), "latch holds while engaged");

        ctx.pause_latch().release();
        assert!(waiting.is_woken());
        assert!(waiting.poll().is_ready());
    }
}
