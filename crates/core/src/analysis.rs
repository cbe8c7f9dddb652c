//! Analysis job record and the result aggregate.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::{DetectedComponent, DetectedConnection};
use crate::error::CoreError;
use crate::progress::{JobStatus, ProgressSnapshot, ProgressView};
use crate::threat::{ComponentThreatSet, Summary, MAX_COUNTERMEASURES};
use crate::types::{AnalysisId, Timestamp};

// ---------------------------------------------------------------------------
// Locale
// ---------------------------------------------------------------------------

/// Output language forwarded to the capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locale {
    #[default]
    #[serde(rename = "pt-BR")]
    PtBr,
    #[serde(rename = "en-US")]
    EnUs,
}

impl Locale {
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::PtBr => "pt-BR",
            Self::EnUs => "en-US",
        }
    }

    /// Accepts `pt-BR`, `pt`, `en-US`, `en` in any case. Anything else
    /// falls back to the default locale.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "en" | "en-us" => Self::EnUs,
            _ => Self::PtBr,
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Uploaded diagram bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct DiagramImage {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DiagramImage {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

impl fmt::Debug for DiagramImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagramImage")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Persisted analysis job, without the image payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub id: AnalysisId,
    pub image_name: String,
    pub language: Locale,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl AnalysisJob {
    pub fn view(&self) -> ProgressView {
        ProgressView {
            id: self.id,
            status: self.status,
            progress: self.progress.clone(),
            error: self.error.clone(),
        }
    }
}

/// One entry of the analysis listing.
///
/// `detected_provider` and `summary` come from the result and are absent
/// until the analysis completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisListItem {
    pub id: AnalysisId,
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_provider: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    pub progress: ProgressSnapshot,
    pub created_at: Timestamp,
}

impl AnalysisListItem {
    pub fn new(job: &AnalysisJob, result: Option<&AnalysisResult>) -> Self {
        Self {
            id: job.id,
            image_name: job.image_name.clone(),
            detected_provider: result.map(|r| r.detected_provider.clone()),
            status: job.status,
            summary: result.map(|r| r.summary),
            progress: job.progress.clone(),
            created_at: job.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Result aggregate
// ---------------------------------------------------------------------------

/// How the canonical component list was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMeta {
    pub secondary_available: bool,
    /// Raw Secondary detections received.
    pub secondary_detections: usize,
    /// Components reported by the Primary Detector.
    pub primary_detections: usize,
    /// Size of the canonical list after merging.
    pub merged_components: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_inference_time_ms: Option<f64>,
}

/// Final output of a completed analysis.
///
/// `summary` is derived from `threats`; use [`AnalysisResult::new`] or
/// [`AnalysisResult::recompute_summary`] rather than filling it by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub components: Vec<DetectedComponent>,
    pub connections: Vec<DetectedConnection>,
    pub threats: Vec<ComponentThreatSet>,
    pub summary: Summary,
    pub detected_provider: String,
    #[serde(default)]
    pub existing_mitigations: Vec<String>,
    pub detection: DetectionMeta,
}

impl AnalysisResult {
    pub fn new(
        components: Vec<DetectedComponent>,
        connections: Vec<DetectedConnection>,
        threats: Vec<ComponentThreatSet>,
        detected_provider: impl Into<String>,
        existing_mitigations: Vec<String>,
        detection: DetectionMeta,
    ) -> Self {
        let summary = Summary::compute(components.len(), &threats);
        Self {
            components,
            connections,
            threats,
            summary,
            detected_provider: detected_provider.into(),
            existing_mitigations,
            detection,
        }
    }

    pub fn recompute_summary(&mut self) {
        self.summary = Summary::compute(self.components.len(), &self.threats);
    }

    /// Check the aggregate invariants before it is persisted.
    ///
    /// - every component id appears exactly once among the threat sets,
    ///   and no threat set names an unknown component
    /// - connections reference known components
    /// - countermeasure lists respect the cap
    /// - the summary matches its source data
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut ids = HashSet::with_capacity(self.components.len());
        for component in &self.components {
            if !ids.insert(component.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate component id '{}'",
                    component.id
                )));
            }
            if !component.provenance_consistent() {
                return Err(CoreError::Validation(format!(
                    "Component '{}' has provenance '{:?}' with inconsistent confidence",
                    component.id, component.provenance
                )));
            }
        }

        let mut covered = HashSet::with_capacity(self.threats.len());
        for set in &self.threats {
            if !ids.contains(set.component_id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Threat set for unknown component '{}'",
                    set.component_id
                )));
            }
            if !covered.insert(set.component_id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Component '{}' has more than one threat set",
                    set.component_id
                )));
            }
            if let Some(t) = set
                .threats
                .iter()
                .find(|t| t.countermeasures.len() > MAX_COUNTERMEASURES)
            {
                return Err(CoreError::Validation(format!(
                    "Threat '{}' on '{}' has {} countermeasures (max {MAX_COUNTERMEASURES})",
                    t.category,
                    set.component_id,
                    t.countermeasures.len()
                )));
            }
        }
        if covered.len() != ids.len() {
            return Err(CoreError::Validation(format!(
                "{} of {} components have no threat set",
                ids.len() - covered.len(),
                ids.len()
            )));
        }

        if let Some(c) = self
            .connections
            .iter()
            .find(|c| !ids.contains(c.from.as_str()) || !ids.contains(c.to.as_str()))
        {
            return Err(CoreError::Validation(format!(
                "Connection {} -> {} references an unknown component",
                c.from, c.to
            )));
        }

        if self.summary != Summary::compute(self.components.len(), &self.threats) {
            return Err(CoreError::Validation(
                "Summary does not match threat sets".to_string(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentType;
    use crate::threat::{Severity, StrideCategory, ThreatFinding};
    use assert_matches::assert_matches;

    fn sample() -> AnalysisResult {
        let components = vec![
            DetectedComponent::new("app", "App", ComponentType::Server),
            DetectedComponent::new("db", "DB", ComponentType::Database),
        ];
        let connections = vec![DetectedConnection::new("app", "db", "TCP")];
        let threats = vec![
            ComponentThreatSet::new(
                "app",
                vec![ThreatFinding::new(StrideCategory::Spoofing, Severity::High, "s")],
            ),
            ComponentThreatSet::empty("db"),
        ];
        AnalysisResult::new(
            components,
            connections,
            threats,
            "aws",
            vec!["WAF".into()],
            DetectionMeta::default(),
        )
    }

    #[test]
    fn new_computes_summary() {
        let result = sample();
        assert_eq!(result.summary.total_components, 2);
        assert_eq!(result.summary.total_threats, 1);
        assert_eq!(result.summary.high_threats, 1);
        assert!(result.validate().is_ok());
    }

    #[test]
    fn missing_threat_set_is_invalid() {
        let mut result = sample();
        result.threats.pop();
        result.recompute_summary();
        assert_matches!(result.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn duplicate_threat_set_is_invalid() {
        let mut result = sample();
        result.threats.push(ComponentThreatSet::empty("app"));
        assert_matches!(result.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn stale_summary_is_invalid() {
        let mut result = sample();
        result.threats[1].threats.push(ThreatFinding::new(
            StrideCategory::Tampering,
            Severity::Low,
            "t",
        ));
        assert!(result.validate().is_err());
        result.recompute_summary();
        assert!(result.validate().is_ok());
    }

    #[test]
    fn dangling_connection_is_invalid() {
        let mut result = sample();
        result.connections.push(DetectedConnection::new("app", "ghost", "HTTP"));
        assert!(result.validate().is_err());
    }

    #[test]
    fn result_json_is_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["detectedProvider"], "aws");
        assert_eq!(json["summary"]["totalThreats"], 1);
        assert_eq!(json["detection"]["secondaryAvailable"], false);
        assert_eq!(json["threats"][0]["componentId"], "app");
    }

    #[test]
    fn locale_parsing_defaults_to_portuguese() {
        assert_eq!(Locale::from_tag("en"), Locale::EnUs);
        assert_eq!(Locale::from_tag("EN_us"), Locale::EnUs);
        assert_eq!(Locale::from_tag("pt-BR"), Locale::PtBr);
        assert_eq!(Locale::from_tag("fr"), Locale::PtBr);
        assert_eq!(serde_json::to_string(&Locale::EnUs).unwrap(), "\"en-US\"");
    }

    #[test]
    fn image_debug_hides_bytes() {
        let image = DiagramImage::new("d.png", "image/png", vec![0u8; 2048]);
        let debug = format!("{image:?}");
        assert!(debug.contains("len: 2048"));
        assert!(!debug.contains("0, 0"));
    }
}
