//! Rows of the `analysis_queue` table.

use sqlx::FromRow;
use threatlens_core::queue::{JobEnvelope, JobOptions, QueueState};
use threatlens_core::types::AnalysisId;

use crate::error::StoreError;
use crate::store::ClaimedJob;

#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryRow {
    pub job_id: AnalysisId,
    pub analysis_id: AnalysisId,
    pub options: serde_json::Value,
    pub state: String,
    pub attempts_made: i32,
}

impl QueueEntryRow {
    pub fn state(&self) -> Result<QueueState, StoreError> {
        parse_state(&self.state)
    }

    pub fn envelope(&self) -> Result<JobEnvelope, StoreError> {
        let options: JobOptions = serde_json::from_value(self.options.clone())?;
        let mut envelope = JobEnvelope::with_options(self.analysis_id, options);
        envelope.job_id = self.job_id;
        Ok(envelope)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made.max(0) as u32
    }

    pub fn into_claimed(self) -> Result<ClaimedJob, StoreError> {
        Ok(ClaimedJob {
            envelope: self.envelope()?,
            attempt: self.attempts_made(),
        })
    }
}

pub fn parse_state(value: &str) -> Result<QueueState, StoreError> {
    QueueState::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown queue state '{value}'")))
}
