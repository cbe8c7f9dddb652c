//! Threat analysis contract and the per-component request.

use async_trait::async_trait;
use serde::Serialize;
use threatlens_core::analysis::Locale;
use threatlens_core::component::{connection_summary, DetectedComponent, DetectedConnection};
use threatlens_core::threat::ThreatFinding;

use crate::error::AnalystError;

/// Placeholder for empty context fields.
const NONE: &str = "none";

/// Everything the analyst is told about one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatRequest {
    pub component: DetectedComponent,
    /// See [`connection_summary`].
    pub connection_summary: String,
    /// The component's own provider, else the diagram-level one.
    pub provider: String,
    pub existing_controls: String,
    pub existing_mitigations: String,
    pub replica_of: String,
    pub locale: Locale,
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        NONE.to_string()
    } else {
        items.join(", ")
    }
}

impl ThreatRequest {
    pub fn for_component(
        component: &DetectedComponent,
        connections: &[DetectedConnection],
        detected_provider: &str,
        existing_mitigations: &[String],
        locale: Locale,
    ) -> Self {
        Self {
            component: component.clone(),
            connection_summary: connection_summary(connections, &component.id),
            provider: component
                .provider
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| detected_provider.to_string()),
            existing_controls: join_or_none(&component.existing_security_controls),
            existing_mitigations: join_or_none(existing_mitigations),
            replica_of: component
                .replica_of
                .clone()
                .unwrap_or_else(|| NONE.to_string()),
            locale,
        }
    }
}

#[async_trait]
pub trait ThreatAnalyst: Send + Sync {
    /// Findings for one component. Implementations cap countermeasures.
    async fn analyze(&self, request: &ThreatRequest) -> Result<Vec<ThreatFinding>, AnalystError>;
}
