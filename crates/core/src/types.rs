/// Analysis identifiers double as queue job identifiers.
pub type AnalysisId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
