//! Job status, pipeline stages and the progress state machine.
//!
//! Stages move strictly forward:
//!
//! - `waiting`              -> `detecting_components`
//! - `detecting_components` -> `detecting_components`, `analyzing_stride`, `generating_report`
//! - `analyzing_stride`     -> `analyzing_stride`, `generating_report`
//! - `generating_report`    -> `completed`
//!
//! and every non-terminal stage may move to `failed`. Self-transitions carry
//! intermediate updates (a new message or the next component). A retry
//! re-enters `waiting` through [`ProgressMachine::restart`], which is the
//! only way backwards.
//!
//! Percentages never decrease except on the move to `failed`, which pins
//! them to 0.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{AnalysisId, Timestamp};

// ---------------------------------------------------------------------------
// Percentage layout
// ---------------------------------------------------------------------------

/// Percentage while detection runs.
pub const PCT_DETECTING: u8 = 5;

/// Percentage at which per-component analysis starts.
pub const PCT_ANALYSIS_START: u8 = 30;

/// Share of the bar covered by per-component analysis.
pub const PCT_ANALYSIS_SPAN: u8 = 60;

/// Percentage while the final aggregate is assembled.
pub const PCT_GENERATING: u8 = 95;

pub const PCT_COMPLETED: u8 = 100;

pub const PCT_FAILED: u8 = 0;

/// Percentage reported before analyzing component `index` (0-based) of `total`.
///
/// `30 + round(60 * index / total)`, rounding halves up.
pub fn enumeration_percentage(index: usize, total: usize) -> u8 {
    if total == 0 {
        return PCT_ANALYSIS_START;
    }
    let index = index.min(total) as u128;
    let total = total as u128;
    let span = u128::from(PCT_ANALYSIS_SPAN);
    let rounded = (2 * span * index + total) / (2 * total);
    PCT_ANALYSIS_START + rounded as u8
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Coarse status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

/// Fine-grained pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Waiting,
    DetectingComponents,
    AnalyzingStride,
    GeneratingReport,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::DetectingComponents => "detecting_components",
            Self::AnalyzingStride => "analyzing_stride",
            Self::GeneratingReport => "generating_report",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stages reachable from `self` in one step.
    pub fn valid_transitions(self) -> &'static [PipelineStage] {
        use PipelineStage::*;
        match self {
            Waiting => &[DetectingComponents, Failed],
            DetectingComponents => &[DetectingComponents, AnalyzingStride, GeneratingReport, Failed],
            AnalyzingStride => &[AnalyzingStride, GeneratingReport, Failed],
            GeneratingReport => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: PipelineStage) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// The job status implied by a stage.
    pub fn job_status(self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
            _ => JobStatus::Processing,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Point-in-time progress record, persisted and published as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub stage: PipelineStage,
    pub message: String,
    pub percentage: u8,
    #[serde(default)]
    pub current_component: u32,
    #[serde(default)]
    pub total_components: u32,
    #[serde(rename = "timestamp")]
    pub updated_at: Timestamp,
}

impl ProgressSnapshot {
    pub fn new(stage: PipelineStage, message: impl Into<String>, percentage: u8) -> Self {
        Self {
            stage,
            message: message.into(),
            percentage,
            current_component: 0,
            total_components: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_components(mut self, current: u32, total: u32) -> Self {
        self.current_component = current;
        self.total_components = total;
        self
    }

    pub fn waiting() -> Self {
        Self::new(PipelineStage::Waiting, "Waiting in queue", 0)
    }

    pub fn detecting(message: impl Into<String>) -> Self {
        Self::new(PipelineStage::DetectingComponents, message, PCT_DETECTING)
    }

    /// Snapshot taken before analyzing component `index` (0-based) of `total`.
    pub fn analyzing(index: usize, total: usize, component_name: &str) -> Self {
        Self::new(
            PipelineStage::AnalyzingStride,
            format!("Analyzing {component_name} ({}/{total})", index + 1),
            enumeration_percentage(index, total),
        )
        .with_components(count(index).saturating_add(1), count(total))
    }

    pub fn generating(total: usize) -> Self {
        Self::new(PipelineStage::GeneratingReport, "Generating report", PCT_GENERATING)
            .with_components(count(total), count(total))
    }

    pub fn completed(total: usize) -> Self {
        Self::new(PipelineStage::Completed, "Analysis completed", PCT_COMPLETED)
            .with_components(count(total), count(total))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(PipelineStage::Failed, message, PCT_FAILED)
    }
}

/// Component counter, saturating at `u32::MAX`.
fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::waiting()
    }
}

/// Caller-facing view of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub id: AnalysisId,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressView {
    /// A stream should stop after emitting a terminal view.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// View reported when progress cannot be fetched.
    pub fn fetch_failed(id: AnalysisId, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            id,
            status: JobStatus::Failed,
            progress: ProgressSnapshot::failed(error.clone()),
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("Cannot move progress from '{from}' to '{to}'")]
    IllegalTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    #[error("Progress would regress from {from}% to {to}% in stage '{stage}'")]
    PercentageRegressed {
        stage: PipelineStage,
        from: u8,
        to: u8,
    },

    #[error("Percentage {percentage}% is not valid for stage '{stage}'")]
    OutOfRange { stage: PipelineStage, percentage: u8 },
}

/// Tracks the current snapshot of one job and validates every move.
///
/// Callers validate with [`check`](Self::check), persist, and only then
/// [`commit`](Self::commit), so a failed write leaves the machine on the
/// last persisted snapshot.
#[derive(Debug, Clone)]
pub struct ProgressMachine {
    current: ProgressSnapshot,
}

impl ProgressMachine {
    /// Start in `waiting`.
    pub fn new() -> Self {
        Self {
            current: ProgressSnapshot::waiting(),
        }
    }

    /// Resume from a persisted snapshot.
    pub fn resume(snapshot: ProgressSnapshot) -> Self {
        Self { current: snapshot }
    }

    pub fn current(&self) -> &ProgressSnapshot {
        &self.current
    }

    pub fn check(&self, next: &ProgressSnapshot) -> Result<(), ProgressError> {
        let from = self.current.stage;

        if !from.can_transition_to(next.stage) {
            return Err(ProgressError::IllegalTransition {
                from,
                to: next.stage,
            });
        }

        let in_range = match next.stage {
            PipelineStage::Completed => next.percentage == PCT_COMPLETED,
            PipelineStage::Failed => next.percentage == PCT_FAILED,
            _ => next.percentage < PCT_COMPLETED,
        };
        if !in_range {
            return Err(ProgressError::OutOfRange {
                stage: next.stage,
                percentage: next.percentage,
            });
        }

        if next.stage != PipelineStage::Failed && next.percentage < self.current.percentage {
            return Err(ProgressError::PercentageRegressed {
                stage: next.stage,
                from: self.current.percentage,
                to: next.percentage,
            });
        }

        Ok(())
    }

    /// Accept `next` unconditionally. Call [`check`](Self::check) first.
    pub fn commit(&mut self, next: ProgressSnapshot) {
        self.current = next;
    }

    /// Validate and accept in one step.
    pub fn advance(&mut self, next: ProgressSnapshot) -> Result<(), ProgressError> {
        self.check(&next)?;
        self.commit(next);
        Ok(())
    }

    /// Re-enter `waiting` for a fresh run. Completed jobs cannot restart.
    pub fn restart(&mut self) -> Result<&ProgressSnapshot, ProgressError> {
        if self.current.stage == PipelineStage::Completed {
            return Err(ProgressError::IllegalTransition {
                from: PipelineStage::Completed,
                to: PipelineStage::Waiting,
            });
        }
        self.current = ProgressSnapshot::waiting();
        Ok(&self.current)
    }
}

impl Default for ProgressMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
