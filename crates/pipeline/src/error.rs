use threatlens_core::error::CoreError;
use threatlens_core::progress::ProgressError;
use threatlens_core::types::AnalysisId;
use threatlens_db::StoreError;
use threatlens_detectors::AnalystError;

/// Errors that end a pipeline run.
///
/// Degraded capability calls never surface here; they are absorbed by the
/// detection and enumeration stages. What remains is fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Analysis {0} not found")]
    JobNotFound(AnalysisId),

    #[error("Diagram image for analysis {0} is missing")]
    ImageMissing(AnalysisId),

    /// A persistence call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A progress update was rejected by the state machine.
    #[error(transparent)]
    Transition(#[from] ProgressError),

    /// The threat analyst reported an error that aborts the job.
    #[error(transparent)]
    Analysis(#[from] AnalystError),

    #[error("Analysis result rejected: {0}")]
    InvalidResult(#[from] CoreError),
}
