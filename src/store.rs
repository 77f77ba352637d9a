//! State-store ports and the persisted job layout
//!
//! The engine persists through these traits and never chooses a storage
//! technology itself. [`StateStore`] covers single-process jobs;
//! [`DistributedStateStore`] extends it with the atomic claim/finalize
//! protocol multi-worker execution relies on.
//!
//! Implementations must ensure atomicity for claim and finalize operations
//! and maintain consistency across crashes.

use crate::record::ProcessedRecord;
use crate::JobStatus;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Batch execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Waiting to be processed or claimed
    Pending,
    /// Currently executing (or claimed by a worker)
    Processing,
    /// All records ran; counts are final
    Completed,
    /// The batch raised and was not completed
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "PENDING"),
            BatchStatus::Processing => write!(f, "PROCESSING"),
            BatchStatus::Completed => write!(f, "COMPLETED"),
            BatchStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Persisted batch metadata; the in-flight record slice is never stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchMeta {
    pub id: String,
    /// 0-based, monotonic within the job; `batches[i].index == i`
    pub index: usize,
    pub status: BatchStatus,
    pub processed_count: u64,
    pub failed_count: u64,
}

/// The slice of engine configuration persisted with the job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfigSnapshot {
    pub batch_size: usize,
    pub continue_on_error: bool,
}

/// Persisted job state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub id: String,
    pub config: JobConfigSnapshot,
    pub status: JobStatus,
    pub batches: Vec<BatchMeta>,
    /// Records observed so far; exact only after the stream ends
    pub total_records: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub distributed: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Progress snapshot derived from counters and the batch list
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    pub pending_records: u64,
    /// Resolved records over total, in percent, two decimals
    pub percentage: f64,
    /// Completed batches so far
    pub current_batch: usize,
    /// Batches observed so far; final once the stream ends
    pub total_batches: usize,
    pub elapsed_ms: u64,
}

impl JobProgress {
    /// Percentage helper shared by the engine and store implementations
    pub(crate) fn percent(resolved: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (resolved as f64 / total as f64 * 10_000.0).round() / 100.0
        }
    }
}

/// Status and counts applied to one batch
#[derive(Debug, Clone, Copy)]
pub struct BatchStateUpdate {
    pub status: BatchStatus,
    pub processed_count: u64,
    pub failed_count: u64,
}

/// Persistence port for single-process jobs
///
/// All methods are async and may fail; the scheduler treats a store failure
/// like any other exception. Implementations must not starve the cooperative
/// scheduler.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the full job snapshot (upsert by job id)
    async fn save_job_state(&self, job: &JobState) -> Result<()>;

    /// Load a job snapshot; `None` when the id is unknown
    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>>;

    /// Update one batch's status and counts (upsert by `(job_id, batch_id)`)
    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()>;

    /// Persist one record (upsert by `(job_id, record.index)`)
    async fn save_processed_record(
        &self,
        job_id: &str,
        batch_id: &str,
        record: &ProcessedRecord,
    ) -> Result<()>;

    /// Records whose status is `invalid` or `failed`
    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>>;

    /// Records not yet in a terminal status; empty in streaming mode
    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>>;

    /// Records whose status is `processed`
    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>>;

    /// Progress snapshot computed from persisted state
    async fn get_progress(&self, job_id: &str) -> Result<JobProgress>;
}

/// A worker's exclusive right to process one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReservation {
    pub job_id: String,
    pub batch_id: String,
    pub batch_index: usize,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    /// First record index covered by the batch
    pub record_start_index: u64,
    /// One past the last record index covered by the batch
    pub record_end_index: u64,
}

/// Why a claim attempt returned empty-handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRefusal {
    JobNotFound,
    JobNotProcessing,
    NoPendingBatches,
}

impl fmt::Display for ClaimRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimRefusal::JobNotFound => write!(f, "JOB_NOT_FOUND"),
            ClaimRefusal::JobNotProcessing => write!(f, "JOB_NOT_PROCESSING"),
            ClaimRefusal::NoPendingBatches => write!(f, "NO_PENDING_BATCHES"),
        }
    }
}

/// Result of an atomic claim attempt
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(BatchReservation),
    NotClaimed(ClaimRefusal),
}

/// Aggregate view of a distributed job
#[derive(Debug, Clone, Serialize)]
pub struct DistributedStatus {
    pub job_status: JobStatus,
    pub total_records: u64,
    pub total_batches: usize,
    pub pending_batches: usize,
    pub processing_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
}

/// One row of the authoritative distributed batch table
///
/// The `version` column increments on every claim, release, and
/// reclamation; optimistic stores compare-and-swap on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedBatch {
    pub id: String,
    pub index: usize,
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub record_start_index: u64,
    pub record_end_index: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub version: u64,
}

/// Persistence port for multi-worker jobs
///
/// `claim_batch` and `try_finalize_job` must be atomic across concurrent
/// callers: two workers claiming the same batch must produce exactly one
/// success, and the finalize transition fires exactly once per job.
#[async_trait]
pub trait DistributedStateStore: StateStore {
    /// Atomically claim the lowest-index pending batch
    async fn claim_batch(&self, job_id: &str, worker_id: &str) -> Result<ClaimOutcome>;

    /// Return a claimed batch to `PENDING` without processing it
    async fn release_batch(&self, job_id: &str, batch_id: &str) -> Result<()>;

    /// Reset batches stuck in `PROCESSING` longer than `timeout` back to
    /// `PENDING`; returns the count reclaimed
    async fn reclaim_stale_batches(&self, job_id: &str, timeout: Duration) -> Result<usize>;

    /// Bulk-persist a batch's records during the prepare phase
    async fn save_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
        records: &[ProcessedRecord],
    ) -> Result<()>;

    /// Load the records a reservation covers
    async fn get_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
    ) -> Result<Vec<ProcessedRecord>>;

    /// Aggregate batch counts for worker-side polling
    async fn get_distributed_status(&self, job_id: &str) -> Result<DistributedStatus>;

    /// Move the job from `PROCESSING` to a terminal status once all batches
    /// are terminal: `FAILED` if any batch failed, `COMPLETED` otherwise.
    ///
    /// Returns `Some(terminal)` on the exactly-once transition and `None`
    /// in every other case, without mutation.
    async fn try_finalize_job(&self, job_id: &str) -> Result<Option<JobStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_terminal() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
    }

    #[test]
    fn test_job_state_round_trip() {
        let state = JobState {
            id: "j1".into(),
            config: JobConfigSnapshot {
                batch_size: 100,
                continue_on_error: true,
            },
            status: JobStatus::Paused,
            batches: vec![BatchMeta {
                id: "b0".into(),
                index: 0,
                status: BatchStatus::Completed,
                processed_count: 99,
                failed_count: 1,
            }],
            total_records: 100,
            started_at: Utc::now(),
            completed_at: None,
            distributed: false,
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"PAUSED\""));
        assert!(!json.contains("distributed"), "false flag is elided");

        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, JobStatus::Paused);
        assert_eq!(back.batches, state.batches);
        assert_eq!(back.total_records, 100);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(JobProgress::percent(0, 0), 0.0);
        assert_eq!(JobProgress::percent(1500, 1500), 100.0);
        assert_eq!(JobProgress::percent(1, 3), 33.33);
    }
}
