//! Job Worker: runs one analysis from `waiting` to a terminal state.

use std::sync::Arc;

use threatlens_core::analysis::{AnalysisJob, AnalysisResult};
use threatlens_core::progress::{JobStatus, PipelineStage, ProgressMachine, ProgressSnapshot};
use threatlens_core::threat::Summary;
use threatlens_core::types::AnalysisId;
use threatlens_db::AnalysisStore;
use threatlens_events::ProgressBus;

use crate::detection::{reconcile, DetectionStage};
use crate::enumeration::ThreatEnumeration;
use crate::error::PipelineError;
use crate::progress::ProgressReporter;

/// What [`AnalysisWorker::process`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job was already completed; nothing ran.
    AlreadyCompleted,
    Completed(Summary),
}

pub struct AnalysisWorker {
    store: Arc<dyn AnalysisStore>,
    bus: Option<Arc<ProgressBus>>,
    detection: DetectionStage,
    enumeration: ThreatEnumeration,
}

impl AnalysisWorker {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        detection: DetectionStage,
        enumeration: ThreatEnumeration,
    ) -> Self {
        Self {
            store,
            bus: None,
            detection,
            enumeration,
        }
    }

    /// Publish every progress change on `bus` as well as persisting it.
    pub fn with_bus(mut self, bus: Arc<ProgressBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Process analysis `id`.
    ///
    /// A completed job is left untouched. Anything else restarts from
    /// `waiting` and runs every stage again. On failure the job is marked
    /// `failed` and the error is returned so the queue can count the attempt.
    pub async fn process(&self, id: AnalysisId) -> Result<ProcessOutcome, PipelineError> {
        let job = self
            .store
            .find(id)
            .await?
            .ok_or(PipelineError::JobNotFound(id))?;

        if job.status == JobStatus::Completed {
            tracing::info!(analysis_id = %id, "Analysis already completed, skipping");
            return Ok(ProcessOutcome::AlreadyCompleted);
        }

        let mut machine = ProgressMachine::resume(job.progress.clone());
        let restart =
            job.status == JobStatus::Failed || machine.current().stage != PipelineStage::Waiting;
        if restart {
            machine.restart()?;
        }

        let mut reporter = ProgressReporter::new(self.store.as_ref(), self.bus.as_deref(), id, machine);
        let outcome = self.restart_and_run(&job, restart, &mut reporter).await;

        match outcome {
            Ok(summary) => {
                tracing::info!(
                    analysis_id = %id,
                    components = summary.total_components,
                    threats = summary.total_threats,
                    critical = summary.critical_threats,
                    "Analysis completed",
                );
                Ok(ProcessOutcome::Completed(summary))
            }
            Err(err) => {
                tracing::error!(analysis_id = %id, error = %err, "Analysis failed");
                if let Err(record_err) = reporter.fail(&err.to_string()).await {
                    tracing::error!(
                        analysis_id = %id,
                        error = %record_err,
                        "Failed to record analysis failure",
                    );
                }
                Err(err)
            }
        }
    }

    /// Mark analysis `id` failed outside of a run, e.g. after its task
    /// panicked. Records that are not `processing` are left alone.
    pub async fn record_failure(&self, id: AnalysisId, message: &str) -> Result<(), PipelineError> {
        let job = self
            .store
            .find(id)
            .await?
            .ok_or(PipelineError::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Ok(());
        }
        let machine = ProgressMachine::resume(job.progress);
        ProgressReporter::new(self.store.as_ref(), self.bus.as_deref(), id, machine)
            .fail(message)
            .await
    }

    async fn restart_and_run(
        &self,
        job: &AnalysisJob,
        restart: bool,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Summary, PipelineError> {
        if restart {
            self.store.reset_for_processing(job.id).await?;
            tracing::info!(analysis_id = %job.id, previous = %job.progress.stage, "Restarting analysis");
        }
        self.run(job, reporter).await
    }

    async fn run(
        &self,
        job: &AnalysisJob,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Summary, PipelineError> {
        let id = job.id;

        // --- Detect ---
        reporter
            .report(ProgressSnapshot::detecting("Detecting components"))
            .await?;
        let image = self
            .store
            .load_image(id)
            .await?
            .ok_or(PipelineError::ImageMissing(id))?;
        let raw = self.detection.detect(&image, job.language).await;

        // --- Merge ---
        reporter
            .report(ProgressSnapshot::detecting("Merging detections"))
            .await?;
        let model = reconcile(raw);

        // --- Enumerate threats ---
        let threats = self
            .enumeration
            .enumerate(&model, job.language, reporter)
            .await?;

        // --- Summarize ---
        let total = model.components.len();
        reporter.report(ProgressSnapshot::generating(total)).await?;
        let result = AnalysisResult::new(
            model.components,
            model.connections,
            threats,
            model.provider,
            model.mitigations,
            model.meta,
        );
        result.validate()?;

        // --- Persist ---
        reporter
            .complete(ProgressSnapshot::completed(total), &result)
            .await?;
        Ok(result.summary)
    }
}
