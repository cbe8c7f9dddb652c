//! Rows of the `analyses` table.

use sqlx::FromRow;
use threatlens_core::analysis::{AnalysisJob, AnalysisListItem, DiagramImage, Locale};
use threatlens_core::progress::JobStatus;
use threatlens_core::threat::Summary;
use threatlens_core::types::{AnalysisId, Timestamp};

use crate::error::StoreError;

/// Job columns, everything except the image bytes and the result.
#[derive(Debug, Clone, FromRow)]
pub struct AnalysisRow {
    pub id: AnalysisId,
    pub image_name: String,
    pub language: String,
    pub status: String,
    pub progress: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

fn parse_status(id: AnalysisId, value: &str) -> Result<JobStatus, StoreError> {
    JobStatus::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("analysis {id} has status '{value}'")))
}

impl TryFrom<AnalysisRow> for AnalysisJob {
    type Error = StoreError;

    fn try_from(row: AnalysisRow) -> Result<Self, Self::Error> {
        let status = parse_status(row.id, &row.status)?;

        Ok(AnalysisJob {
            id: row.id,
            image_name: row.image_name,
            language: Locale::from_tag(&row.language),
            status,
            progress: serde_json::from_value(row.progress)?,
            error: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Listing columns; provider and summary are read out of the result.
#[derive(Debug, Clone, FromRow)]
pub struct AnalysisListRow {
    pub id: AnalysisId,
    pub image_name: String,
    pub detected_provider: Option<String>,
    pub status: String,
    pub summary: Option<serde_json::Value>,
    pub progress: serde_json::Value,
    pub created_at: Timestamp,
}

impl TryFrom<AnalysisListRow> for AnalysisListItem {
    type Error = StoreError;

    fn try_from(row: AnalysisListRow) -> Result<Self, Self::Error> {
        let summary: Option<Summary> = row.summary.map(serde_json::from_value).transpose()?;
        Ok(AnalysisListItem {
            id: row.id,
            image_name: row.image_name,
            detected_provider: row.detected_provider,
            status: parse_status(row.id, &row.status)?,
            summary,
            progress: serde_json::from_value(row.progress)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ImageRow {
    pub image_name: String,
    pub image_mime_type: String,
    pub image_data: Vec<u8>,
}

impl From<ImageRow> for DiagramImage {
    fn from(row: ImageRow) -> Self {
        DiagramImage::new(row.image_name, row.image_mime_type, row.image_data)
    }
}
