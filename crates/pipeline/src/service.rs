//! Caller-facing operations on analyses and their queue entries.

use std::sync::Arc;

use threatlens_core::analysis::{AnalysisJob, AnalysisListItem, AnalysisResult};
use threatlens_core::progress::{JobStatus, ProgressView};
use threatlens_core::queue::{EnqueueOutcome, JobEnvelope, JobOptions, QueueCounts};
use threatlens_core::types::AnalysisId;
use threatlens_db::{AnalysisStore, JobQueue, NewAnalysis};

use crate::error::PipelineError;

/// Answer to a (re)processing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRequestOutcome {
    Queued,
    AlreadyCompleted,
    /// A waiting, delayed or running queue entry already exists.
    AlreadyProcessing,
}

impl ProcessRequestOutcome {
    pub fn message(self) -> &'static str {
        match self {
            Self::Queued => "Analysis queued for processing",
            Self::AlreadyCompleted => "Analysis already completed",
            Self::AlreadyProcessing => "Analysis is already being processed",
        }
    }
}

#[derive(Clone)]
pub struct AnalysisService {
    store: Arc<dyn AnalysisStore>,
    queue: Arc<dyn JobQueue>,
    options: JobOptions,
}

impl AnalysisService {
    pub fn new(store: Arc<dyn AnalysisStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Create the record and enqueue its first run.
    pub async fn submit(&self, input: NewAnalysis) -> Result<AnalysisJob, PipelineError> {
        let job = self.store.create(input).await?;
        self.queue
            .enqueue(JobEnvelope::with_options(job.id, self.options))
            .await?;
        tracing::info!(analysis_id = %job.id, image = %job.image_name, "Analysis submitted");
        Ok(job)
    }

    /// Queue analysis `id` for a fresh run unless it is completed or
    /// already queued.
    pub async fn process_analysis(
        &self,
        id: AnalysisId,
    ) -> Result<ProcessRequestOutcome, PipelineError> {
        let job = self
            .store
            .find(id)
            .await?
            .ok_or(PipelineError::JobNotFound(id))?;

        if job.status == JobStatus::Completed {
            return Ok(ProcessRequestOutcome::AlreadyCompleted);
        }
        if let Some(state) = self.queue.state(id).await? {
            if state.is_pending() {
                return Ok(ProcessRequestOutcome::AlreadyProcessing);
            }
        }

        self.store.reset_for_processing(id).await?;
        let outcome = match self
            .queue
            .enqueue(JobEnvelope::with_options(id, self.options))
            .await?
        {
            EnqueueOutcome::Enqueued => ProcessRequestOutcome::Queued,
            EnqueueOutcome::AlreadyQueued(_) => ProcessRequestOutcome::AlreadyProcessing,
        };
        tracing::info!(analysis_id = %id, outcome = outcome.message(), "Processing requested");
        Ok(outcome)
    }

    /// Remove the queue entry and the record.
    ///
    /// A running job cannot be removed and yields a conflict.
    pub async fn delete_analysis(&self, id: AnalysisId) -> Result<(), PipelineError> {
        self.queue.remove(id).await?;
        if !self.store.delete(id).await? {
            return Err(PipelineError::JobNotFound(id));
        }
        tracing::info!(analysis_id = %id, "Analysis deleted");
        Ok(())
    }

    pub async fn get_progress(&self, id: AnalysisId) -> Result<ProgressView, PipelineError> {
        self.store
            .find(id)
            .await?
            .map(|job| job.view())
            .ok_or(PipelineError::JobNotFound(id))
    }

    /// Every analysis, newest first.
    pub async fn list_analyses(&self) -> Result<Vec<AnalysisListItem>, PipelineError> {
        Ok(self.store.list().await?)
    }

    pub async fn get_analysis(&self, id: AnalysisId) -> Result<AnalysisJob, PipelineError> {
        self.store
            .find(id)
            .await?
            .ok_or(PipelineError::JobNotFound(id))
    }

    /// The stored result, present only for completed analyses.
    pub async fn get_result(&self, id: AnalysisId) -> Result<Option<AnalysisResult>, PipelineError> {
        Ok(self.store.result(id).await?)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, PipelineError> {
        Ok(self.queue.counts().await?)
    }

    pub fn store(&self) -> &Arc<dyn AnalysisStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }
}
