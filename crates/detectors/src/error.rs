use std::time::Duration;

/// Errors from a detector call.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Detector API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Detector call timed out after {0:?}")]
    Timeout(Duration),

    /// The response body did not contain the expected shape.
    #[error("Malformed detector response: {0}")]
    Malformed(String),
}

/// Errors from a threat-analysis call, classified by how the pipeline
/// must react.
///
/// `Transient` and `Malformed` degrade the component to an empty threat
/// set and enumeration continues. `Fatal` aborts the whole job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalystError {
    #[error("Threat analysis unavailable: {0}")]
    Transient(String),

    #[error("Malformed threat analysis: {0}")]
    Malformed(String),

    #[error("Threat analysis failed: {0}")]
    Fatal(String),
}

impl AnalystError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<DetectorError> for AnalystError {
    /// Rejected credentials will not fix themselves on the next component,
    /// so 401/403 are fatal. Everything else is per-component.
    fn from(err: DetectorError) -> Self {
        if matches!(err, DetectorError::Api { status: 401 | 403, .. }) {
            return Self::Fatal(err.to_string());
        }
        match err {
            DetectorError::Malformed(msg) => Self::Malformed(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}
