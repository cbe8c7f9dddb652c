//! Threat enumeration stage.

use std::sync::Arc;

use threatlens_core::analysis::Locale;
use threatlens_core::progress::ProgressSnapshot;
use threatlens_core::threat::ComponentThreatSet;
use threatlens_detectors::{ThreatAnalyst, ThreatRequest};

use crate::detection::CanonicalModel;
use crate::error::PipelineError;
use crate::progress::ProgressReporter;

/// Analyzes the canonical components one at a time, in list order.
pub struct ThreatEnumeration {
    analyst: Arc<dyn ThreatAnalyst>,
}

impl ThreatEnumeration {
    pub fn new(analyst: Arc<dyn ThreatAnalyst>) -> Self {
        Self { analyst }
    }

    /// One threat set per component, in component order.
    ///
    /// Progress is reported before each component. Non-fatal analyst
    /// errors leave that component with an empty set; a fatal one aborts.
    pub async fn enumerate(
        &self,
        model: &CanonicalModel,
        locale: Locale,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Vec<ComponentThreatSet>, PipelineError> {
        let total = model.components.len();
        let mut sets = Vec::with_capacity(total);

        for (index, component) in model.components.iter().enumerate() {
            reporter
                .report(ProgressSnapshot::analyzing(index, total, &component.name))
                .await?;

            let request = ThreatRequest::for_component(
                component,
                &model.connections,
                &model.provider,
                &model.mitigations,
                locale,
            );

            let threats = match self.analyst.analyze(&request).await {
                Ok(mut threats) => {
                    threats
                        .iter_mut()
                        .for_each(|t| t.truncate_countermeasures());
                    threats
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(component_id = %component.id, error = %e, "Threat analysis aborted");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(
                        component_id = %component.id,
                        error = %e,
                        "Threat analysis failed for component, recording no threats",
                    );
                    Vec::new()
                }
            };

            tracing::debug!(
                component_id = %component.id,
                threats = threats.len(),
                "Component analyzed",
            );
            sets.push(ComponentThreatSet::new(component.id.clone(), threats));
        }

        Ok(sets)
    }
}
