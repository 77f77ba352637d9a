//! In-memory reference store
//!
//! Implements both store ports over a single mutex-guarded table, which
//! makes claim, reclamation, and finalisation trivially atomic: every
//! operation runs entirely inside one lock section with no await points.
//! Useful for tests and for embedded callers that do not need durability.

use crate::record::{ProcessedRecord, RecordStatus};
use crate::store::{
    BatchReservation, BatchStateUpdate, BatchStatus, ClaimOutcome, ClaimRefusal,
    DistributedBatch, DistributedStateStore, DistributedStatus, JobProgress, JobState, StateStore,
};
use crate::JobStatus;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, JobState>,
    /// `(job_id, record_index)`-keyed upserts, ordered by index
    records: HashMap<String, BTreeMap<u64, ProcessedRecord>>,
    batch_records: HashMap<(String, String), Vec<ProcessedRecord>>,
    /// Authoritative batch table for claiming, one row list per job
    distributed: HashMap<String, Vec<DistributedBatch>>,
}

impl MemoryInner {
    /// Keep the job row's convenience mirror in step with the batch table
    fn mirror_batch(&mut self, job_id: &str, batch_id: &str, status: BatchStatus) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            if let Some(meta) = job.batches.iter_mut().find(|b| b.id == batch_id) {
                meta.status = status;
            }
        }
    }
}

/// Non-durable store keeping all state in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_job_state(&self, job: &JobState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn update_batch_state(
        &self,
        job_id: &str,
        batch_id: &str,
        update: BatchStateUpdate,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(batches) = inner.distributed.get_mut(job_id) {
            if let Some(row) = batches.iter_mut().find(|b| b.id == batch_id) {
                row.status = update.status;
                row.processed_count = update.processed_count;
                row.failed_count = update.failed_count;
            }
        }
        if let Some(job) = inner.jobs.get_mut(job_id) {
            match job.batches.iter_mut().find(|b| b.id == batch_id) {
                Some(meta) => {
                    meta.status = update.status;
                    meta.processed_count = update.processed_count;
                    meta.failed_count = update.failed_count;
                }
                None => {
                    let index = job.batches.len();
                    job.batches.push(crate::store::BatchMeta {
                        id: batch_id.to_string(),
                        index,
                        status: update.status,
                        processed_count: update.processed_count,
                        failed_count: update.failed_count,
                    });
                }
            }
        }
        Ok(())
    }

    async fn save_processed_record(
        &self,
        job_id: &str,
        _batch_id: &str,
        record: &ProcessedRecord,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .records
            .entry(job_id.to_string())
            .or_default()
            .insert(record.index, record.clone());
        Ok(())
    }

    async fn get_failed_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>> {
        self.records_with(job_id, |status| {
            matches!(status, RecordStatus::Failed | RecordStatus::Invalid)
        })
        .await
    }

    async fn get_pending_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>> {
        self.records_with(job_id, |status| {
            matches!(status, RecordStatus::Pending | RecordStatus::Valid)
        })
        .await
    }

    async fn get_processed_records(&self, job_id: &str) -> Result<Vec<ProcessedRecord>> {
        self.records_with(job_id, |status| status == RecordStatus::Processed)
            .await
    }

    async fn get_progress(&self, job_id: &str) -> Result<JobProgress> {
        let inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| anyhow!("unknown job: {}", job_id))?;

        let mut processed = 0u64;
        let mut failed = 0u64;
        if let Some(records) = inner.records.get(job_id) {
            for record in records.values() {
                match record.status {
                    RecordStatus::Processed => processed += 1,
                    RecordStatus::Failed | RecordStatus::Invalid => failed += 1,
                    _ => {}
                }
            }
        }

        let total = job.total_records;
        let completed_batches = job
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .count();
        let end = job.completed_at.unwrap_or_else(Utc::now);
        Ok(JobProgress {
            total_records: total,
            processed_records: processed,
            failed_records: failed,
            pending_records: total.saturating_sub(processed + failed),
            percentage: JobProgress::percent(processed + failed, total),
            current_batch: completed_batches,
            total_batches: job.batches.len(),
            elapsed_ms: (end - job.started_at).num_milliseconds().max(0) as u64,
        })
    }
}

impl MemoryStore {
    async fn records_with(
        &self,
        job_id: &str,
        keep: impl Fn(RecordStatus) -> bool,
    ) -> Result<Vec<ProcessedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(job_id)
            .map(|records| {
                records
                    .values()
                    .filter(|r| keep(r.status))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DistributedStateStore for MemoryStore {
    async fn claim_batch(&self, job_id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get(job_id) else {
            return Ok(ClaimOutcome::NotClaimed(ClaimRefusal::JobNotFound));
        };
        if job.status != JobStatus::Processing {
            return Ok(ClaimOutcome::NotClaimed(ClaimRefusal::JobNotProcessing));
        }

        let claimed = inner
            .distributed
            .get_mut(job_id)
            .and_then(|batches| {
                batches
                    .iter_mut()
                    .filter(|b| b.status == BatchStatus::Pending)
                    .min_by_key(|b| b.index)
            })
            .map(|row| {
                row.status = BatchStatus::Processing;
                row.worker_id = Some(worker_id.to_string());
                row.claimed_at = Some(Utc::now());
                row.version += 1;
                BatchReservation {
                    job_id: job_id.to_string(),
                    batch_id: row.id.clone(),
                    batch_index: row.index,
                    worker_id: worker_id.to_string(),
                    claimed_at: row.claimed_at.unwrap_or_else(Utc::now),
                    record_start_index: row.record_start_index,
                    record_end_index: row.record_end_index,
                }
            });

        match claimed {
            Some(reservation) => {
                inner.mirror_batch(job_id, &reservation.batch_id, BatchStatus::Processing);
                Ok(ClaimOutcome::Claimed(reservation))
            }
            None => Ok(ClaimOutcome::NotClaimed(ClaimRefusal::NoPendingBatches)),
        }
    }

    async fn release_batch(&self, job_id: &str, batch_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut released = false;
        if let Some(batches) = inner.distributed.get_mut(job_id) {
            if let Some(row) = batches
                .iter_mut()
                .find(|b| b.id == batch_id && b.status == BatchStatus::Processing)
            {
                row.status = BatchStatus::Pending;
                row.worker_id = None;
                row.claimed_at = None;
                row.version += 1;
                released = true;
            }
        }
        if released {
            inner.mirror_batch(job_id, batch_id, BatchStatus::Pending);
        }
        Ok(())
    }

    async fn reclaim_stale_batches(&self, job_id: &str, timeout: Duration) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);

        let mut reclaimed_ids = Vec::new();
        if let Some(batches) = inner.distributed.get_mut(job_id) {
            for row in batches.iter_mut() {
                let stale = row.status == BatchStatus::Processing
                    && row
                        .claimed_at
                        .is_some_and(|claimed| now - claimed > timeout);
                if stale {
                    row.status = BatchStatus::Pending;
                    row.worker_id = None;
                    row.claimed_at = None;
                    row.version += 1;
                    reclaimed_ids.push(row.id.clone());
                }
            }
        }
        for batch_id in &reclaimed_ids {
            inner.mirror_batch(job_id, batch_id, BatchStatus::Pending);
        }
        Ok(reclaimed_ids.len())
    }

    async fn save_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
        records: &[ProcessedRecord],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let rows = inner.distributed.entry(job_id.to_string()).or_default();
        let index = rows.len();
        rows.push(DistributedBatch {
            id: batch_id.to_string(),
            index,
            status: BatchStatus::Pending,
            worker_id: None,
            claimed_at: None,
            record_start_index: records.first().map(|r| r.index).unwrap_or(0),
            record_end_index: records.last().map(|r| r.index + 1).unwrap_or(0),
            processed_count: 0,
            failed_count: 0,
            version: 0,
        });
        inner
            .batch_records
            .insert((job_id.to_string(), batch_id.to_string()), records.to_vec());
        let by_index = inner.records.entry(job_id.to_string()).or_default();
        for record in records {
            by_index.insert(record.index, record.clone());
        }
        Ok(())
    }

    async fn get_batch_records(
        &self,
        job_id: &str,
        batch_id: &str,
    ) -> Result<Vec<ProcessedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batch_records
            .get(&(job_id.to_string(), batch_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_distributed_status(&self, job_id: &str) -> Result<DistributedStatus> {
        let inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| anyhow!("unknown job: {}", job_id))?;
        let batches = inner.distributed.get(job_id);
        let count = |status: BatchStatus| {
            batches
                .map(|rows| rows.iter().filter(|b| b.status == status).count())
                .unwrap_or(0)
        };
        Ok(DistributedStatus {
            job_status: job.status,
            total_records: job.total_records,
            total_batches: batches.map(Vec::len).unwrap_or(0),
            pending_batches: count(BatchStatus::Pending),
            processing_batches: count(BatchStatus::Processing),
            completed_batches: count(BatchStatus::Completed),
            failed_batches: count(BatchStatus::Failed),
        })
    }

    async fn try_finalize_job(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let mut inner = self.inner.lock().await;
        let all_terminal = inner
            .distributed
            .get(job_id)
            .map(|rows| rows.iter().all(|b| b.status.is_terminal()))
            .unwrap_or(true);
        let any_failed = inner
            .distributed
            .get(job_id)
            .map(|rows| rows.iter().any(|b| b.status == BatchStatus::Failed))
            .unwrap_or(false);

        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || !all_terminal {
            return Ok(None);
        }
        let final_status = if any_failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        job.status = final_status;
        job.completed_at = Some(Utc::now());
        Ok(Some(final_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawRecord;
    use crate::store::JobConfigSnapshot;
    use serde_json::json;
    use std::sync::Arc;

    fn record(index: u64) -> ProcessedRecord {
        let mut raw = RawRecord::new();
        raw.insert("n".into(), json!(index));
        ProcessedRecord::pending(index, raw)
    }

    fn job(id: &str, batches: Vec<crate::store::BatchMeta>, total: u64) -> JobState {
        JobState {
            id: id.to_string(),
            config: JobConfigSnapshot {
                batch_size: 10,
                continue_on_error: false,
            },
            status: JobStatus::Processing,
            batches,
            total_records: total,
            started_at: Utc::now(),
            completed_at: None,
            distributed: true,
        }
    }

    async fn seed_two_batches(store: &MemoryStore) -> (Vec<ProcessedRecord>, Vec<ProcessedRecord>) {
        let first: Vec<_> = (0..10).map(record).collect();
        let second: Vec<_> = (10..20).map(record).collect();
        store.save_batch_records("j", "b0", &first).await.unwrap();
        store.save_batch_records("j", "b1", &second).await.unwrap();
        store.save_job_state(&job("j", Vec::new(), 20)).await.unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_record_upsert_by_index() {
        let store = MemoryStore::new();
        let mut r = record(5);
        store.save_processed_record("j", "b", &r).await.unwrap();

        r.status = RecordStatus::Processed;
        store.save_processed_record("j", "b", &r).await.unwrap();

        let processed = store.get_processed_records("j").await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].index, 5);
    }

    #[tokio::test]
    async fn test_claim_lowest_pending_first() {
        let store = MemoryStore::new();
        seed_two_batches(&store).await;

        let ClaimOutcome::Claimed(first) = store.claim_batch("j", "w1").await.unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(first.batch_index, 0);
        assert_eq!(first.record_start_index, 0);
        assert_eq!(first.record_end_index, 10);

        let ClaimOutcome::Claimed(second) = store.claim_batch("j", "w2").await.unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(second.batch_index, 1);

        match store.claim_batch("j", "w3").await.unwrap() {
            ClaimOutcome::NotClaimed(reason) => {
                assert_eq!(reason, ClaimRefusal::NoPendingBatches)
            }
            ClaimOutcome::Claimed(_) => panic!("nothing left to claim"),
        }
    }

    #[tokio::test]
    async fn test_claim_refusals() {
        let store = MemoryStore::new();
        match store.claim_batch("missing", "w").await.unwrap() {
            ClaimOutcome::NotClaimed(reason) => assert_eq!(reason, ClaimRefusal::JobNotFound),
            ClaimOutcome::Claimed(_) => panic!("job does not exist"),
        }

        let mut paused = job("j", Vec::new(), 0);
        paused.status = JobStatus::Paused;
        store.save_job_state(&paused).await.unwrap();
        match store.claim_batch("j", "w").await.unwrap() {
            ClaimOutcome::NotClaimed(reason) => {
                assert_eq!(reason, ClaimRefusal::JobNotProcessing)
            }
            ClaimOutcome::Claimed(_) => panic!("job is not processing"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        seed_two_batches(&store).await;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                match store.claim_batch("j", &format!("w{}", worker)).await.unwrap() {
                    ClaimOutcome::Claimed(r) => Some(r.batch_index),
                    ClaimOutcome::NotClaimed(_) => None,
                }
            }));
        }

        let mut claimed: Vec<usize> = Vec::new();
        for handle in handles {
            if let Some(index) = handle.await.unwrap() {
                claimed.push(index);
            }
        }
        claimed.sort_unstable();
        assert_eq!(claimed, vec![0, 1], "each batch claimed exactly once");
    }

    #[tokio::test]
    async fn test_reclaim_stale_batches() {
        let store = MemoryStore::new();
        seed_two_batches(&store).await;

        let ClaimOutcome::Claimed(reservation) = store.claim_batch("j", "w1").await.unwrap()
        else {
            panic!("expected a claim");
        };

        // fresh claim is not stale
        let reclaimed = store
            .reclaim_stale_batches("j", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);

        // zero timeout makes it stale immediately
        let reclaimed = store
            .reclaim_stale_batches("j", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let ClaimOutcome::Claimed(again) = store.claim_batch("j", "w2").await.unwrap() else {
            panic!("reclaimed batch is claimable again");
        };
        assert_eq!(again.batch_id, reservation.batch_id);
        assert_eq!(again.worker_id, "w2");
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let store = MemoryStore::new();
        seed_two_batches(&store).await;

        assert!(
            store.try_finalize_job("j").await.unwrap().is_none(),
            "pending batches block finalisation"
        );

        for batch_id in ["b0", "b1"] {
            store.claim_batch("j", "w").await.unwrap();
            store
                .update_batch_state(
                    "j",
                    batch_id,
                    BatchStateUpdate {
                        status: BatchStatus::Completed,
                        processed_count: 10,
                        failed_count: 0,
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(
            store.try_finalize_job("j").await.unwrap(),
            Some(JobStatus::Completed)
        );
        assert!(
            store.try_finalize_job("j").await.unwrap().is_none(),
            "second finalisation attempt is a no-op"
        );
    }

    #[tokio::test]
    async fn test_finalize_failed_when_any_batch_failed() {
        let store = MemoryStore::new();
        seed_two_batches(&store).await;

        store.claim_batch("j", "w").await.unwrap();
        store.claim_batch("j", "w").await.unwrap();
        store
            .update_batch_state(
                "j",
                "b0",
                BatchStateUpdate {
                    status: BatchStatus::Completed,
                    processed_count: 10,
                    failed_count: 0,
                },
            )
            .await
            .unwrap();
        store
            .update_batch_state(
                "j",
                "b1",
                BatchStateUpdate {
                    status: BatchStatus::Failed,
                    processed_count: 3,
                    failed_count: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.try_finalize_job("j").await.unwrap(),
            Some(JobStatus::Failed)
        );
    }
}
