//! The analysis pipeline.
//!
//! [`AnalysisWorker::process`] runs one analysis end to end:
//! detect, merge, enumerate threats, summarize, persist. Every stage
//! change goes through a [`ProgressReporter`], which validates it against
//! the progress state machine, persists it and publishes it.
//!
//! [`AnalysisService`] holds the queue-facing operations used by callers:
//! submitting, (re)processing, deleting and reading progress.

pub mod detection;
pub mod enumeration;
pub mod error;
pub mod progress;
pub mod service;
pub mod worker;

pub use detection::{CanonicalModel, DetectionSettings, DetectionStage, RawDetections};
pub use enumeration::ThreatEnumeration;
pub use error::PipelineError;
pub use progress::ProgressReporter;
pub use service::{AnalysisService, ProcessRequestOutcome};
pub use worker::{AnalysisWorker, ProcessOutcome};
