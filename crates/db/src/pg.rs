//! Postgres-backed [`AnalysisStore`] and [`JobQueue`].

use std::time::Duration;

use async_trait::async_trait;
use threatlens_core::analysis::{AnalysisJob, AnalysisListItem, AnalysisResult, DiagramImage};
use threatlens_core::progress::ProgressSnapshot;
use threatlens_core::queue::{
    EnqueueOutcome, JobEnvelope, QueueCounts, QueueState, RetryDecision, DEFAULT_LOCK_DURATION,
    STALLED_ERROR,
};
use threatlens_core::types::AnalysisId;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::queue_entry::parse_state;
use crate::repositories::{AnalysisRepo, QueueRepo};
use crate::store::{AnalysisStore, ClaimedJob, JobQueue, NewAnalysis};
use crate::DbPool;

// ---------------------------------------------------------------------------
// Analyses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgAnalysisStore {
    pool: DbPool,
}

impl PgAnalysisStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn found(id: AnalysisId, touched: bool) -> Result<(), StoreError> {
    if touched {
        Ok(())
    } else {
        Err(StoreError::analysis_not_found(id))
    }
}

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    async fn create(&self, input: NewAnalysis) -> Result<AnalysisJob, StoreError> {
        let progress = serde_json::to_value(ProgressSnapshot::waiting())?;
        let row = AnalysisRepo::insert(
            &self.pool,
            Uuid::now_v7(),
            &input.image.file_name,
            &input.image.mime_type,
            &input.image.bytes,
            input.language.as_tag(),
            &progress,
        )
        .await?;
        row.try_into()
    }

    async fn find(&self, id: AnalysisId) -> Result<Option<AnalysisJob>, StoreError> {
        AnalysisRepo::find_by_id(&self.pool, id)
            .await?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<AnalysisListItem>, StoreError> {
        AnalysisRepo::list(&self.pool)
            .await?
            .into_iter()
            .map(AnalysisListItem::try_from)
            .collect()
    }

    async fn load_image(&self, id: AnalysisId) -> Result<Option<DiagramImage>, StoreError> {
        Ok(AnalysisRepo::find_image(&self.pool, id)
            .await?
            .map(DiagramImage::from))
    }

    async fn reset_for_processing(&self, id: AnalysisId) -> Result<(), StoreError> {
        let progress = serde_json::to_value(ProgressSnapshot::waiting())?;
        found(id, AnalysisRepo::reset(&self.pool, id, &progress).await?)
    }

    async fn update_progress(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
    ) -> Result<(), StoreError> {
        let progress = serde_json::to_value(snapshot)?;
        found(id, AnalysisRepo::update_progress(&self.pool, id, &progress).await?)
    }

    async fn complete(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        result: &AnalysisResult,
    ) -> Result<(), StoreError> {
        let progress = serde_json::to_value(snapshot)?;
        let result_json = serde_json::to_value(result)?;
        found(
            id,
            AnalysisRepo::complete(&self.pool, id, &progress, &result_json).await?,
        )
    }

    async fn fail(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        error: &str,
    ) -> Result<(), StoreError> {
        let progress = serde_json::to_value(snapshot)?;
        found(id, AnalysisRepo::fail(&self.pool, id, &progress, error).await?)
    }

    async fn result(&self, id: AnalysisId) -> Result<Option<AnalysisResult>, StoreError> {
        match AnalysisRepo::find_result(&self.pool, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: AnalysisId) -> Result<bool, StoreError> {
        Ok(AnalysisRepo::delete(&self.pool, id).await?)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: DbPool,
    lock_duration: Duration,
}

impl PgJobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self::with_lock_duration(pool, DEFAULT_LOCK_DURATION)
    }

    /// Queue whose `active` entries are released after `lock_duration`.
    pub fn with_lock_duration(pool: DbPool, lock_duration: Duration) -> Self {
        Self {
            pool,
            lock_duration,
        }
    }

    /// Count an expired lock as a failed attempt and apply the retry policy.
    async fn release_stalled(&self) -> Result<(), StoreError> {
        let lock_ms = i64::try_from(self.lock_duration.as_millis()).unwrap_or(i64::MAX);
        for row in QueueRepo::find_stalled(&self.pool, lock_ms).await? {
            let envelope = row.envelope()?;
            let decision = envelope.retry_decision(row.attempts_made());
            let delay_ms = match decision {
                RetryDecision::Retry { delay, .. } => {
                    Some(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
                }
                RetryDecision::Exhausted => None,
            };

            let released = QueueRepo::release_stalled(
                &self.pool,
                row.job_id,
                row.attempts_made,
                delay_ms,
                STALLED_ERROR,
            )
            .await?;
            if !released {
                continue;
            }
            tracing::warn!(job_id = %row.job_id, ?decision, "Released stalled queue entry");
            if decision == RetryDecision::Exhausted {
                self.prune(QueueState::Failed, envelope.options.retention.failed)
                    .await?;
            }
        }
        Ok(())
    }

    async fn prune(&self, state: QueueState, keep: u32) -> Result<(), StoreError> {
        let pruned = QueueRepo::prune_finished(&self.pool, state, i64::from(keep)).await?;
        if pruned > 0 {
            tracing::debug!(state = %state, pruned, "Pruned finished queue entries");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, StoreError> {
        let options = serde_json::to_value(envelope.options)?;
        let inserted = QueueRepo::insert_or_replace_finished(
            &self.pool,
            envelope.job_id,
            envelope.payload.analysis_id,
            &options,
        )
        .await?;

        if inserted.is_some() {
            return Ok(EnqueueOutcome::Enqueued);
        }

        match QueueRepo::find(&self.pool, envelope.job_id).await? {
            Some(row) => Ok(EnqueueOutcome::AlreadyQueued(row.state()?)),
            // Finished and pruned between the two statements.
            None => Err(StoreError::Conflict(format!(
                "queue entry {} changed during enqueue",
                envelope.job_id
            ))),
        }
    }

    async fn state(&self, job_id: AnalysisId) -> Result<Option<QueueState>, StoreError> {
        QueueRepo::find(&self.pool, job_id)
            .await?
            .map(|row| row.state())
            .transpose()
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>, StoreError> {
        self.release_stalled().await?;
        QueueRepo::claim_next(&self.pool)
            .await?
            .map(|row| row.into_claimed())
            .transpose()
    }

    async fn complete(&self, job_id: AnalysisId) -> Result<(), StoreError> {
        let row = QueueRepo::find(&self.pool, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Queue entry",
                id: job_id,
            })?;
        QueueRepo::mark_completed(&self.pool, job_id).await?;
        let envelope = row.envelope()?;
        self.prune(QueueState::Completed, envelope.options.retention.completed)
            .await
    }

    async fn fail(&self, job_id: AnalysisId, error: &str) -> Result<RetryDecision, StoreError> {
        let row = QueueRepo::find(&self.pool, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Queue entry",
                id: job_id,
            })?;
        let envelope = row.envelope()?;
        let decision = envelope.retry_decision(row.attempts_made());

        match decision {
            RetryDecision::Retry { delay, .. } => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                QueueRepo::schedule_retry(&self.pool, job_id, delay_ms, error).await?;
            }
            RetryDecision::Exhausted => {
                QueueRepo::mark_failed(&self.pool, job_id, error).await?;
                self.prune(QueueState::Failed, envelope.options.retention.failed)
                    .await?;
            }
        }
        Ok(decision)
    }

    async fn remove(&self, job_id: AnalysisId) -> Result<bool, StoreError> {
        if QueueRepo::delete_unless_active(&self.pool, job_id).await? {
            return Ok(true);
        }
        match QueueRepo::find(&self.pool, job_id).await? {
            Some(row) if row.state()? == QueueState::Active => Err(StoreError::Conflict(
                format!("job {job_id} is running and cannot be removed"),
            )),
            _ => Ok(false),
        }
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let mut counts = QueueCounts::default();
        for (state, n) in QueueRepo::count_by_state(&self.pool).await? {
            counts.add(parse_state(&state)?, n.max(0) as u64);
        }
        Ok(counts)
    }
}
