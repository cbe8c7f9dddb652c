//! Persistence contracts used by the pipeline, the worker pool and the API.

use async_trait::async_trait;
use threatlens_core::analysis::{
    AnalysisJob, AnalysisListItem, AnalysisResult, DiagramImage, Locale,
};
use threatlens_core::progress::ProgressSnapshot;
use threatlens_core::queue::{EnqueueOutcome, JobEnvelope, QueueCounts, QueueState, RetryDecision};
use threatlens_core::types::AnalysisId;

use crate::error::StoreError;

/// Input for [`AnalysisStore::create`].
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub image: DiagramImage,
    pub language: Locale,
}

/// Analysis records: job status, progress snapshot, image and result.
///
/// Every write that touches progress replaces the whole snapshot.
/// Methods addressing a missing id fail with [`StoreError::NotFound`],
/// except the lookups that return `Option`.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Insert a new record in `processing` / `waiting`.
    async fn create(&self, input: NewAnalysis) -> Result<AnalysisJob, StoreError>;

    async fn find(&self, id: AnalysisId) -> Result<Option<AnalysisJob>, StoreError>;

    /// Every analysis, newest first.
    async fn list(&self) -> Result<Vec<AnalysisListItem>, StoreError>;

    async fn load_image(&self, id: AnalysisId) -> Result<Option<DiagramImage>, StoreError>;

    /// Put the record back in `processing` / `waiting` for a fresh run,
    /// clearing any error and previous result.
    async fn reset_for_processing(&self, id: AnalysisId) -> Result<(), StoreError>;

    /// Persist an intermediate snapshot. Status stays `processing`.
    async fn update_progress(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
    ) -> Result<(), StoreError>;

    /// Write the result together with the terminal `completed` snapshot,
    /// atomically.
    async fn complete(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        result: &AnalysisResult,
    ) -> Result<(), StoreError>;

    /// Mark the record `failed` with `error`. No result is stored.
    async fn fail(
        &self,
        id: AnalysisId,
        snapshot: &ProgressSnapshot,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn result(&self, id: AnalysisId) -> Result<Option<AnalysisResult>, StoreError>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, id: AnalysisId) -> Result<bool, StoreError>;
}

/// A job handed to a worker by [`JobQueue::claim_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedJob {
    pub envelope: JobEnvelope,
    /// 1-based attempt number of this run.
    pub attempt: u32,
}

/// Durable queue keyed by job id.
///
/// At most one live (waiting, delayed or active) entry exists per job id.
/// A finished entry is replaced by a new enqueue of the same id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, StoreError>;

    async fn state(&self, job_id: AnalysisId) -> Result<Option<QueueState>, StoreError>;

    /// Move the oldest due entry to `active` and count the attempt.
    async fn claim_next(&self) -> Result<Option<ClaimedJob>, StoreError>;

    async fn complete(&self, job_id: AnalysisId) -> Result<(), StoreError>;

    /// Record a failed attempt and schedule a retry when attempts remain.
    async fn fail(&self, job_id: AnalysisId, error: &str) -> Result<RetryDecision, StoreError>;

    /// Remove an entry that is not running. Fails with
    /// [`StoreError::Conflict`] for an active entry.
    async fn remove(&self, job_id: AnalysisId) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
