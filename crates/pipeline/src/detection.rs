//! Detection stage: call both detectors, then reconcile their output into
//! the canonical component list.
//!
//! Neither detector can fail the job. A failing Primary Detector yields an
//! empty detection, and an unavailable, slow or failing Secondary Detector
//! yields no secondary detections.

use std::sync::Arc;
use std::time::Duration;

use threatlens_core::analysis::{DetectionMeta, DiagramImage, Locale};
use threatlens_core::canonical::{clear_dangling_replicas, dedupe_ids, retain_known_connections};
use threatlens_core::component::{DetectedComponent, DetectedConnection};
use threatlens_core::merge::merge_detections;
use threatlens_detectors::secondary::DEFAULT_CONFIDENCE;
use threatlens_detectors::{PrimaryDetection, PrimaryDetector, SecondaryDetector, SecondaryPrediction};
use tokio::time::timeout;

/// Bounds for the Secondary Detector calls.
#[derive(Debug, Clone, Copy)]
pub struct DetectionSettings {
    pub probe_timeout: Duration,
    pub detect_timeout: Duration,
    /// Threshold forwarded to the predict call.
    pub confidence: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            detect_timeout: Duration::from_secs(30),
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

/// Both detectors' output, before reconciliation.
#[derive(Debug, Clone)]
pub struct RawDetections {
    pub primary: PrimaryDetection,
    pub secondary_available: bool,
    pub secondary: SecondaryPrediction,
}

/// The canonical component list plus the context carried downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalModel {
    pub components: Vec<DetectedComponent>,
    pub connections: Vec<DetectedConnection>,
    pub provider: String,
    pub mitigations: Vec<String>,
    pub meta: DetectionMeta,
}

pub struct DetectionStage {
    primary: Arc<dyn PrimaryDetector>,
    secondary: Arc<dyn SecondaryDetector>,
    settings: DetectionSettings,
}

impl DetectionStage {
    pub fn new(
        primary: Arc<dyn PrimaryDetector>,
        secondary: Arc<dyn SecondaryDetector>,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            primary,
            secondary,
            settings,
        }
    }

    /// Run the Primary Detector, then the Secondary Detector if it is up.
    pub async fn detect(&self, image: &DiagramImage, locale: Locale) -> RawDetections {
        let primary = match self.primary.detect(image, locale).await {
            Ok(detection) => detection,
            Err(e) => {
                tracing::warn!(error = %e, "Primary detection failed, continuing with an empty result");
                PrimaryDetection::empty()
            }
        };

        let secondary_available = self.probe_secondary().await;
        let secondary = if secondary_available {
            self.detect_secondary(image).await
        } else {
            SecondaryPrediction::default()
        };

        RawDetections {
            primary,
            secondary_available,
            secondary,
        }
    }

    async fn probe_secondary(&self) -> bool {
        match timeout(self.settings.probe_timeout, self.secondary.probe()).await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                tracing::warn!("Secondary detector reports no model loaded");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Secondary detector probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.settings.probe_timeout.as_millis() as u64,
                    "Secondary detector probe timed out",
                );
                false
            }
        }
    }

    async fn detect_secondary(&self, image: &DiagramImage) -> SecondaryPrediction {
        let call = self.secondary.detect(image, self.settings.confidence);
        match timeout(self.settings.detect_timeout, call).await {
            Ok(Ok(prediction)) => prediction,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Secondary detection failed");
                SecondaryPrediction::default()
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.settings.detect_timeout.as_millis() as u64,
                    "Secondary detection timed out",
                );
                SecondaryPrediction::default()
            }
        }
    }
}

/// Merge and sanitize the raw detections into a [`CanonicalModel`].
pub fn reconcile(raw: RawDetections) -> CanonicalModel {
    let RawDetections {
        primary,
        secondary_available,
        secondary,
    } = raw;
    let PrimaryDetection {
        provider,
        mitigations,
        mut components,
        mut connections,
    } = primary;

    let primary_detections = components.len();
    let renamed = dedupe_ids(&mut components);

    let outcome = merge_detections(components, &secondary.detections);
    let mut components = outcome.components;

    let dropped = retain_known_connections(&mut connections, &components);
    let cleared = clear_dangling_replicas(&mut components);

    tracing::info!(
        primary = primary_detections,
        secondary = secondary.detections.len(),
        matched = outcome.matched,
        added = outcome.added,
        discarded = outcome.discarded,
        renamed,
        dropped_connections = dropped,
        cleared_replicas = cleared,
        "Detections reconciled",
    );

    let meta = DetectionMeta {
        secondary_available,
        secondary_detections: secondary.detections.len(),
        primary_detections,
        merged_components: components.len(),
        secondary_inference_time_ms: secondary.inference_time_ms,
    };

    CanonicalModel {
        components,
        connections,
        provider,
        mitigations,
        meta,
    }
}
