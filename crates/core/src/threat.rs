//! STRIDE threat findings and the derived summary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on countermeasures kept per finding.
pub const MAX_COUNTERMEASURES: usize = 5;

// ---------------------------------------------------------------------------
// Vocabularies
// ---------------------------------------------------------------------------

/// The six STRIDE categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrideCategory {
    Spoofing,
    Tampering,
    Repudiation,
    #[serde(rename = "Information Disclosure")]
    InformationDisclosure,
    #[serde(rename = "Denial of Service")]
    DenialOfService,
    #[serde(rename = "Elevation of Privilege")]
    ElevationOfPrivilege,
}

impl StrideCategory {
    pub const ALL: [StrideCategory; 6] = [
        Self::Spoofing,
        Self::Tampering,
        Self::Repudiation,
        Self::InformationDisclosure,
        Self::DenialOfService,
        Self::ElevationOfPrivilege,
    ];

    /// Parse a category label, ignoring case, spaces and punctuation.
    pub fn from_label(label: &str) -> Option<Self> {
        let key: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match key.as_str() {
            "spoofing" | "s" => Some(Self::Spoofing),
            "tampering" | "t" => Some(Self::Tampering),
            "repudiation" | "r" => Some(Self::Repudiation),
            "informationdisclosure" | "i" => Some(Self::InformationDisclosure),
            "denialofservice" | "dos" | "d" => Some(Self::DenialOfService),
            "elevationofprivilege" | "e" => Some(Self::ElevationOfPrivilege),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Spoofing => "Spoofing",
            Self::Tampering => "Tampering",
            Self::Repudiation => "Repudiation",
            Self::InformationDisclosure => "Information Disclosure",
            Self::DenialOfService => "Denial of Service",
            Self::ElevationOfPrivilege => "Elevation of Privilege",
        }
    }
}

impl fmt::Display for StrideCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// A single security finding for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFinding {
    pub category: StrideCategory,
    pub description: String,
    pub severity: Severity,
    /// Ordered, at most [`MAX_COUNTERMEASURES`] entries.
    #[serde(default)]
    pub countermeasures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_justification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_mitigation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_data: Option<String>,
}

impl ThreatFinding {
    pub fn new(category: StrideCategory, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
            severity,
            countermeasures: Vec::new(),
            severity_justification: None,
            existing_mitigation: None,
            affected_data: None,
        }
    }

    pub fn with_countermeasures<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.countermeasures = items.into_iter().map(Into::into).collect();
        self.truncate_countermeasures();
        self
    }

    /// Drop countermeasures beyond [`MAX_COUNTERMEASURES`], keeping order.
    pub fn truncate_countermeasures(&mut self) {
        self.countermeasures.truncate(MAX_COUNTERMEASURES);
    }
}

/// All findings for one canonical component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentThreatSet {
    pub component_id: String,
    #[serde(default)]
    pub threats: Vec<ThreatFinding>,
}

impl ComponentThreatSet {
    pub fn new(component_id: impl Into<String>, threats: Vec<ThreatFinding>) -> Self {
        Self {
            component_id: component_id.into(),
            threats,
        }
    }

    /// The degraded result for a component whose analysis failed.
    pub fn empty(component_id: impl Into<String>) -> Self {
        Self::new(component_id, Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Counts derived from the threat sets. Always recomputable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_components: usize,
    pub total_threats: usize,
    pub critical_threats: usize,
    pub high_threats: usize,
    pub medium_threats: usize,
    pub low_threats: usize,
}

impl Summary {
    pub fn compute(total_components: usize, threat_sets: &[ComponentThreatSet]) -> Self {
        let mut summary = Self {
            total_components,
            ..Self::default()
        };

        for threat in threat_sets.iter().flat_map(|set| &set.threats) {
            summary.total_threats += 1;
            match threat.severity {
                Severity::Critical => summary.critical_threats += 1,
                Severity::High => summary.high_threats += 1,
                Severity::Medium => summary.medium_threats += 1,
                Severity::Low => summary.low_threats += 1,
            }
        }

        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels_parse_leniently() {
        assert_eq!(
            StrideCategory::from_label("information_disclosure"),
            Some(StrideCategory::InformationDisclosure)
        );
        assert_eq!(
            StrideCategory::from_label("Denial of Service"),
            Some(StrideCategory::DenialOfService)
        );
        assert_eq!(StrideCategory::from_label("SPOOFING"), Some(StrideCategory::Spoofing));
        assert_eq!(StrideCategory::from_label("lateral movement"), None);
    }

    #[test]
    fn every_category_round_trips_through_its_label() {
        for category in StrideCategory::ALL {
            assert_eq!(StrideCategory::from_label(category.label()), Some(category));
        }
    }

    #[test]
    fn category_serializes_with_display_name() {
        let json = serde_json::to_string(&StrideCategory::ElevationOfPrivilege).unwrap();
        assert_eq!(json, "\"Elevation of Privilege\"");
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::from_label(" High "), Some(Severity::High));
        assert_eq!(Severity::from_label("severe"), None);
    }

    #[test]
    fn countermeasures_are_capped_at_five() {
        let finding = ThreatFinding::new(StrideCategory::Tampering, Severity::High, "x")
            .with_countermeasures(["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(finding.countermeasures, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn summary_counts_by_severity() {
        let sets = vec![
            ComponentThreatSet::new(
                "a",
                vec![
                    ThreatFinding::new(StrideCategory::Spoofing, Severity::Critical, "1"),
                    ThreatFinding::new(StrideCategory::Tampering, Severity::High, "2"),
                ],
            ),
            ComponentThreatSet::new(
                "b",
                vec![
                    ThreatFinding::new(StrideCategory::Repudiation, Severity::Low, "3"),
                    ThreatFinding::new(StrideCategory::Repudiation, Severity::Low, "4"),
                    ThreatFinding::new(StrideCategory::DenialOfService, Severity::Medium, "5"),
                ],
            ),
            ComponentThreatSet::empty("c"),
        ];

        let summary = Summary::compute(3, &sets);
        assert_eq!(
            summary,
            Summary {
                total_components: 3,
                total_threats: 5,
                critical_threats: 1,
                high_threats: 1,
                medium_threats: 1,
                low_threats: 2,
            }
        );
    }

    #[test]
    fn summary_of_nothing_is_zero() {
        assert_eq!(Summary::compute(0, &[]), Summary::default());
    }
}
