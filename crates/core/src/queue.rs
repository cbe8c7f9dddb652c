//! Job envelope, queue states and the retry policy.
//!
//! One job type exists: analyze the diagram of one analysis. The job id is
//! the analysis id, which is what keeps a second enqueue of the same
//! analysis from producing a second concurrent execution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AnalysisId;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Total attempts, including the first run.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;

/// Finished entries kept per terminal state before pruning.
pub const DEFAULT_KEEP_COMPLETED: u32 = 100;
pub const DEFAULT_KEEP_FAILED: u32 = 50;

/// How long an entry may stay `active` before it counts as stalled.
///
/// A worker that dies mid-job leaves its entry `active`; once the lock
/// expires the next claim treats the run as a failed attempt.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);

/// Failure recorded for an attempt whose lock expired.
pub const STALLED_ERROR: &str = "job stalled: lock expired before completion";

/// Upper bound on the exponent so the multiplication cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub analysis_id: AnalysisId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based count of failures so far).
    ///
    /// `base * 2^(attempt - 1)`: 5s, 10s, 20s, ... with the default base.
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Exponential { base_ms } => {
                let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::Exponential {
                base_ms: DEFAULT_BACKOFF_BASE_MS,
            },
            retention: Retention {
                completed: DEFAULT_KEEP_COMPLETED,
                failed: DEFAULT_KEEP_FAILED,
            },
        }
    }
}

/// What is put on the queue for one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: AnalysisId,
    pub payload: JobPayload,
    pub options: JobOptions,
}

impl JobEnvelope {
    pub fn for_analysis(analysis_id: AnalysisId) -> Self {
        Self::with_options(analysis_id, JobOptions::default())
    }

    pub fn with_options(analysis_id: AnalysisId, options: JobOptions) -> Self {
        Self {
            job_id: analysis_id,
            payload: JobPayload { analysis_id },
            options,
        }
    }

    /// Decide what happens after the `attempts_made`-th attempt failed.
    pub fn retry_decision(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made < self.options.attempts {
            RetryDecision::Retry {
                attempt: attempts_made + 1,
                delay: self.options.backoff.delay(attempts_made),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again as attempt number `attempt` once `delay` has elapsed.
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Entries in these states block a new enqueue of the same job id.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, state: QueueState, n: u64) {
        match state {
            QueueState::Waiting => self.waiting += n,
            QueueState::Delayed => self.delayed += n,
            QueueState::Active => self.active += n,
            QueueState::Completed => self.completed += n,
            QueueState::Failed => self.failed += n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A pending entry with the same job id already exists.
    AlreadyQueued(QueueState),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
