//! Secondary Detector contract.

use async_trait::async_trait;
use threatlens_core::analysis::DiagramImage;
use threatlens_core::merge::SecondaryDetection;

use crate::error::DetectorError;

/// Default confidence threshold sent with a predict call.
pub const DEFAULT_CONFIDENCE: f64 = 0.05;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecondaryPrediction {
    pub detections: Vec<SecondaryDetection>,
    pub inference_time_ms: Option<f64>,
    /// As reported by the service; may differ from `detections.len()`
    /// when entries failed to parse.
    pub total_detections: usize,
}

#[async_trait]
pub trait SecondaryDetector: Send + Sync {
    /// Whether the detector is up with its model loaded.
    async fn probe(&self) -> Result<bool, DetectorError>;

    async fn detect(
        &self,
        image: &DiagramImage,
        confidence: f64,
    ) -> Result<SecondaryPrediction, DetectorError>;
}
