//! Primary Detector contract.

use async_trait::async_trait;
use threatlens_core::analysis::{DiagramImage, Locale};
use threatlens_core::component::{DetectedComponent, DetectedConnection};

use crate::error::DetectorError;

/// Provider tag used when the detector did not name one.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// What the Primary Detector extracted from a diagram.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryDetection {
    /// Cloud provider tag, e.g. `aws`, `azure`, `gcp`, `generic`.
    pub provider: String,
    /// Pre-existing mitigations visible in the diagram, free text.
    pub mitigations: Vec<String>,
    pub components: Vec<DetectedComponent>,
    pub connections: Vec<DetectedConnection>,
}

impl PrimaryDetection {
    /// The empty-but-valid result substituted when detection fails.
    pub fn empty() -> Self {
        Self {
            provider: UNKNOWN_PROVIDER.to_string(),
            mitigations: Vec::new(),
            components: Vec::new(),
            connections: Vec::new(),
        }
    }
}

#[async_trait]
pub trait PrimaryDetector: Send + Sync {
    async fn detect(
        &self,
        image: &DiagramImage,
        locale: Locale,
    ) -> Result<PrimaryDetection, DetectorError>;
}
