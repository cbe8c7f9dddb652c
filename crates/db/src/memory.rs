//! In-process implementations of [`AnalysisStore`] and [`JobQueue`].
//!
//! Same semantics as the Postgres versions, minus durability. Used by the
//! test suites and by single-process runs without `DATABASE_URL`. Queue
//! timing uses `tokio::time::Instant`, so paused-clock tests can step
//! through retry backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use threatlens_core::analysis::{AnalysisJob, AnalysisListItem, AnalysisResult, DiagramImage};
use threatlens_core::progress::{JobStatus, ProgressSnapshot};
use threatlens_core::queue::{
    EnqueueOutcome, JobEnvelope, QueueCounts, QueueState, RetryDecision, DEFAULT_LOCK_DURATION,
    STALLED_ERROR,
};
use threatlens_core::types::AnalysisId;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{AnalysisStore, ClaimedJob, JobQueue, NewAnalysis};

// ---------------------------------------------------------------------------
// Analyses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredAnalysis {
    job: AnalysisJob,
    image: DiagramImage,
    result: Option<AnalysisResult>,
}

#[derive(Debug, Default)]
pub struct InMemoryAnalysisStore {
    records: RwLock<HashMap<AnalysisId, StoredAnalysis>>,
}

impl InMemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_record<T>(
        &self,
        id: AnalysisId,
        f: impl FnOnce(&mut StoredAnalysis) -> T,
    ) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::analysis_not_found(id))?;
        let out = f(record);
        record.job.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl AnalysisStore for InMemoryAnalysisStore {
    async fn create(&self, input: NewAnalysis) -> Result<AnalysisJob, StoreError> {
        let now = Utc::now();
        let job = AnalysisJob {
            id: Uuid::now_v7(),
            image_name: input.image.file_name.clone(),
            language: input.language,
            status: JobStatus::Processing,
            progress: ProgressSnapshot::waiting(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.records.write().await.insert(
            job.id,
            StoredAnalysis {
                job: job.clone(),
                image: input.image,
                result: None,
            },
        );
        Ok(job)
    }

    async fn find(&self, id: AnalysisId) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(self.records.read().await.get(&id).map(|r| r.job.clone()))
    }

    async fn list(&self) -> Result<Vec<AnalysisListItem>, StoreError> {
        let records = self.records.read().await;
        let mut items: Vec<AnalysisListItem> = records
            .values()
            .map(|r| AnalysisListItem::new(&r.job, r.result.as_ref()))
            .collect();
        items.sort_unstable_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(items)
    }

    async fn load_image(&self, id: AnalysisId) -> Result<Option<DiagramImage>, StoreError> {
        Ok(self.records.read().await.get(&id).map(|r| r.image.clone()))
    }

    async fn reset_for_processing(&self, id: AnalysisId) -> Result<(), StoreError> {
        self.with_record(id, |r| {
            r.job.status = JobStatus::Processing;
            r.job.progress = ProgressSnapshot::waiting();
            r.job.error = None;
            r.result = None;
        })
        .await
    }

    async fn update_progress(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
    ) -> Result<(), StoreError> {
        self.with_record(id, |r| {
            r.job.status = JobStatus::Processing;
            r.job.progress = snapshot.clone();
        })
        .await
    }

    async fn complete(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        result: &AnalysisResult,
    ) -> Result<(), StoreError> {
        self.with_record(id, |r| {
            r.job.status = JobStatus::Completed;
            r.job.progress = snapshot.clone();
            r.job.error = None;
            r.result = Some(result.clone());
        })
        .await
    }

    async fn fail(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        error: &str,
    ) -> Result<(), StoreError> {
        self.with_record(id, |r| {
            r.job.status = JobStatus::Failed;
            r.job.progress = snapshot.clone();
            r.job.error = Some(error.to_string());
            r.result = None;
        })
        .await
    }

    async fn result(&self, id: AnalysisId) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .and_then(|r| r.result.clone()))
    }

    async fn delete(&self, id: AnalysisId) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct QueueEntry {
    envelope: JobEnvelope,
    state: QueueState,
    attempts_made: u32,
    available_at: Instant,
    /// When the current attempt was claimed.
    started_at: Option<Instant>,
    /// Insertion order, used as the FIFO tie-break.
    seq: u64,
    /// Order of reaching a finished state, used for retention.
    finished_seq: u64,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: HashMap<AnalysisId, QueueEntry>,
    next_seq: u64,
}

impl QueueInner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn prune(&mut self, state: QueueState, keep: u32) {
        let mut finished: Vec<(u64, AnalysisId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, e)| (e.finished_seq, *id))
            .collect();
        if finished.len() <= keep as usize {
            return;
        }
        finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in finished.into_iter().skip(keep as usize) {
            self.entries.remove(&id);
        }
    }

    /// Apply the retry policy to a failed attempt of `job_id`.
    fn record_failure(
        &mut self,
        job_id: AnalysisId,
        error: &str,
    ) -> Result<RetryDecision, StoreError> {
        let finished_seq = self.bump();
        let entry = self.entries.get_mut(&job_id).ok_or_else(|| missing(job_id))?;

        let decision = entry.envelope.retry_decision(entry.attempts_made);
        entry.last_error = Some(error.to_string());
        entry.started_at = None;

        match decision {
            RetryDecision::Retry { delay, .. } => {
                entry.state = QueueState::Delayed;
                entry.available_at = Instant::now() + delay;
            }
            RetryDecision::Exhausted => {
                entry.state = QueueState::Failed;
                entry.finished_seq = finished_seq;
                let keep = entry.envelope.options.retention.failed;
                self.prune(QueueState::Failed, keep);
            }
        }
        Ok(decision)
    }

    /// Fail every `active` entry whose lock expired.
    fn release_stalled(&mut self, lock_duration: Duration, now: Instant) {
        let stalled: Vec<AnalysisId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.state == QueueState::Active
                    && e.started_at.is_some_and(|started| started + lock_duration <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for job_id in stalled {
            match self.record_failure(job_id, STALLED_ERROR) {
                Ok(decision) => {
                    tracing::warn!(%job_id, ?decision, "Released stalled queue entry");
                }
                Err(e) => tracing::error!(%job_id, error = %e, "Failed to release stalled entry"),
            }
        }
    }
}

#[derive(Debug)]
pub struct InMemoryJobQueue {
    inner: RwLock<QueueInner>,
    lock_duration: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::with_lock_duration(DEFAULT_LOCK_DURATION)
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose `active` entries are released after `lock_duration`.
    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            inner: RwLock::new(QueueInner::default()),
            lock_duration,
        }
    }

    /// Last recorded failure message of an entry.
    pub async fn last_error(&self, job_id: AnalysisId) -> Option<String> {
        self.inner
            .read()
            .await
            .entries
            .get(&job_id)
            .and_then(|e| e.last_error.clone())
    }
}

fn missing(job_id: AnalysisId) -> StoreError {
    StoreError::NotFound {
        entity: "Queue entry",
        id: job_id,
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.entries.get(&envelope.job_id) {
            if existing.state.is_pending() {
                return Ok(EnqueueOutcome::AlreadyQueued(existing.state));
            }
        }

        let seq = inner.bump();
        inner.entries.insert(
            envelope.job_id,
            QueueEntry {
                envelope,
                state: QueueState::Waiting,
                attempts_made: 0,
                available_at: Instant::now(),
                started_at: None,
                seq,
                finished_seq: 0,
                last_error: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn state(&self, job_id: AnalysisId) -> Result<Option<QueueState>, StoreError> {
        Ok(self.inner.read().await.entries.get(&job_id).map(|e| e.state))
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.release_stalled(self.lock_duration, now);

        let next = inner
            .entries
            .values_mut()
            .filter(|e| {
                matches!(e.state, QueueState::Waiting | QueueState::Delayed)
                    && e.available_at <= now
            })
            .min_by_key(|e| (e.available_at, e.seq));

        Ok(next.map(|entry| {
            entry.state = QueueState::Active;
            entry.attempts_made += 1;
            entry.started_at = Some(now);
            ClaimedJob {
                envelope: entry.envelope,
                attempt: entry.attempts_made,
            }
        }))
    }

    async fn complete(&self, job_id: AnalysisId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let finished_seq = inner.bump();
        let entry = inner.entries.get_mut(&job_id).ok_or_else(|| missing(job_id))?;
        entry.state = QueueState::Completed;
        entry.started_at = None;
        entry.finished_seq = finished_seq;
        entry.last_error = None;
        let keep = entry.envelope.options.retention.completed;
        inner.prune(QueueState::Completed, keep);
        Ok(())
    }

    async fn fail(&self, job_id: AnalysisId, error: &str) -> Result<RetryDecision, StoreError> {
        self.inner.write().await.record_failure(job_id, error)
    }

    async fn remove(&self, job_id: AnalysisId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.entries.get(&job_id).map(|e| e.state) {
            Some(QueueState::Active) => Err(StoreError::Conflict(format!(
                "job {job_id} is running and cannot be removed"
            ))),
            Some(_) => Ok(inner.entries.remove(&job_id).is_some()),
            None => Ok(false),
        }
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = QueueCounts::default();
        for entry in inner.entries.values() {
            counts.add(entry.state, 1);
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use threatlens_core::analysis::{DetectionMeta, Locale};
    use threatlens_core::progress::PipelineStage;
    use threatlens_core::queue::{JobOptions, Retention};

    fn new_analysis() -> NewAnalysis {
        NewAnalysis {
            image: DiagramImage::new("arch.png", "image/png", vec![1, 2, 3]),
            language: Locale::EnUs,
        }
    }

    #[tokio::test]
    async fn create_starts_waiting() {
        let store = InMemoryAnalysisStore::new();
        let job = store.create(new_analysis()).await.unwrap();

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress.stage, PipelineStage::Waiting);
        assert_eq!(job.language, Locale::EnUs);

        let image = store.load_image(job.id).await.unwrap().unwrap();
        assert_eq!(image.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_then_reset_clears_error() {
        let store = InMemoryAnalysisStore::new();
        let job = store.create(new_analysis()).await.unwrap();

        store
            .fail(job.id, &ProgressSnapshot::failed("boom"), "boom")
            .await
            .unwrap();
        let failed = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        store.reset_for_processing(job.id).await.unwrap();
        let reset = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Processing);
        assert!(reset.error.is_none());
    }

    #[tokio::test]
    async fn complete_stores_result_with_status() {
        let store = InMemoryAnalysisStore::new();
        let job = store.create(new_analysis()).await.unwrap();
        let result = AnalysisResult::new(vec![], vec![], vec![], "generic", vec![], DetectionMeta::default());

        store
            .complete(job.id, &ProgressSnapshot::completed(0), &result)
            .await
            .unwrap();

        let found = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Completed);
        assert_eq!(store.result(job.id).await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn list_is_newest_first_with_result_fields() {
        let store = InMemoryAnalysisStore::new();
        let older = store.create(new_analysis()).await.unwrap();
        let newer = store.create(new_analysis()).await.unwrap();
        let result = AnalysisResult::new(vec![], vec![], vec![], "azure", vec![], DetectionMeta::default());
        store
            .complete(older.id, &ProgressSnapshot::completed(0), &result)
            .await
            .unwrap();

        let items = store.list().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, newer.id);
        assert_eq!(items[0].detected_provider, None);
        assert_eq!(items[0].summary, None);
        assert_eq!(items[1].id, older.id);
        assert_eq!(items[1].status, JobStatus::Completed);
        assert_eq!(items[1].detected_provider.as_deref(), Some("azure"));
        assert_eq!(items[1].summary, Some(result.summary));
    }

    #[tokio::test]
    async fn writes_to_unknown_id_are_not_found() {
        let store = InMemoryAnalysisStore::new();
        let err = store
            .update_progress(Uuid::new_v4(), &ProgressSnapshot::waiting())
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::NotFound { .. });
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected_while_live() {
        let queue = InMemoryJobQueue::new();
        let id = Uuid::new_v4();

        assert_eq!(
            queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
            EnqueueOutcome::AlreadyQueued(QueueState::Waiting)
        );

        queue.claim_next().await.unwrap().unwrap();
        assert_eq!(
            queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
            EnqueueOutcome::AlreadyQueued(QueueState::Active)
        );
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_entry_can_be_enqueued_again() {
        let queue = InMemoryJobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.complete(id).await.unwrap();

        assert_eq!(
            queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let queue = InMemoryJobQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.enqueue(JobEnvelope::for_analysis(first)).await.unwrap();
        queue.enqueue(JobEnvelope::for_analysis(second)).await.unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().envelope.job_id, first);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().envelope.job_id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_exhaust() {
        let queue = InMemoryJobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        assert_matches!(
            queue.fail(id, "first").await.unwrap(),
            RetryDecision::Retry { attempt: 2, .. }
        );
        assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Delayed));
        assert!(queue.claim_next().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        queue.fail(id, "second").await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(queue.claim_next().await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        let third = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(third.attempt, 3);

        assert_eq!(queue.fail(id, "third").await.unwrap(), RetryDecision::Exhausted);
        assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Failed));
        assert_eq!(queue.last_error(id).await.as_deref(), Some("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_active_entry_is_reclaimed_after_lock_expires() {
        let queue = InMemoryJobQueue::with_lock_duration(Duration::from_secs(60));
        let id = Uuid::new_v4();
        let options = JobOptions {
            attempts: 2,
            ..JobOptions::default()
        };
        queue
            .enqueue(JobEnvelope::with_options(id, options))
            .await
            .unwrap();

        // Claimed by a worker that never reports back.
        assert_eq!(queue.claim_next().await.unwrap().unwrap().attempt, 1);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Active));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Delayed));
        assert_eq!(queue.last_error(id).await.as_deref(), Some(STALLED_ERROR));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.claim_next().await.unwrap().unwrap().attempt, 2);

        // The second stall uses up the last attempt.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Failed));
    }

    #[tokio::test]
    async fn active_entries_cannot_be_removed() {
        let queue = InMemoryJobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap();
        queue.claim_next().await.unwrap();

        assert_matches!(queue.remove(id).await, Err(StoreError::Conflict(_)));
        queue.complete(id).await.unwrap();
        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn retention_prunes_oldest_finished() {
        let queue = InMemoryJobQueue::new();
        let options = JobOptions {
            retention: Retention {
                completed: 2,
                failed: 1,
            },
            ..JobOptions::default()
        };

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue
                .enqueue(JobEnvelope::with_options(*id, options))
                .await
                .unwrap();
            queue.claim_next().await.unwrap();
            queue.complete(*id).await.unwrap();
        }

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(queue.state(ids[0]).await.unwrap(), None);
        assert_eq!(queue.state(ids[2]).await.unwrap(), Some(QueueState::Completed));
    }
}
