use threatlens_core::types::AnalysisId;

/// Errors raised by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: AnalysisId },

    /// A stored row holds a value the domain does not recognize.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn analysis_not_found(id: AnalysisId) -> Self {
        Self::NotFound {
            entity: "Analysis",
            id,
        }
    }
}
