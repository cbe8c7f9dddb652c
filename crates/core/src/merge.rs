//! Merge Engine: reconciles Primary and Secondary detections.
//!
//! The Primary Detector yields semantically rich components (names,
//! descriptions, connections) whose presence may be imprecise. The
//! Secondary Detector yields calibrated confidences for bare type codes.
//! [`merge_detections`] folds both into one canonical list:
//!
//! 1. Each Primary component, in order, binds the first not-yet-consumed
//!    Secondary detection with an equal type code. A bound component
//!    becomes `hybrid` and carries that detection's confidence; an
//!    unbound one stays `primary`.
//! 2. Every unconsumed detection at or above
//!    [`SECONDARY_ONLY_MIN_CONFIDENCE`] is appended as a new `secondary`
//!    component. Detections below it are discarded.
//!
//! Matching is by type equality only. Bounding boxes are carried but not
//! consulted, so two components of the same type bind in list order
//! rather than by position in the diagram. Confidence is never used as a
//! tie-break.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::component::{ComponentType, DetectedComponent, Provenance};

/// Minimum confidence for an unmatched Secondary detection to become a
/// component of its own.
pub const SECONDARY_ONLY_MIN_CONFIDENCE: f64 = 0.08;

// ---------------------------------------------------------------------------
// Secondary detections
// ---------------------------------------------------------------------------

/// Box in image-relative coordinates (0..1), centre plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedBox {
    #[serde(alias = "x_center")]
    pub x_center: f64,
    #[serde(alias = "y_center")]
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

/// Box in pixel coordinates, corner to corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// One detection reported by the Secondary Detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryDetection {
    /// Raw class label, e.g. `load_balancer`.
    pub label: String,
    /// Label mapped onto the component vocabulary.
    pub type_code: ComponentType,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_normalized: Option<NormalizedBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_pixels: Option<PixelBox>,
}

impl SecondaryDetection {
    pub fn new(label: impl Into<String>, type_code: ComponentType, confidence: f64) -> Self {
        Self {
            label: label.into(),
            type_code,
            confidence,
            bbox_normalized: None,
            bbox_pixels: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Result of [`merge_detections`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Primary components in their original order, then synthesized ones.
    pub components: Vec<DetectedComponent>,
    /// Primary components confirmed by a Secondary detection.
    pub matched: usize,
    /// Secondary-only components appended.
    pub added: usize,
    /// Unmatched detections dropped for low confidence.
    pub discarded: usize,
}

/// Reconcile the two detection sets. See the module docs for the rules.
///
/// Primary ids are expected to be unique already (see
/// [`crate::canonical::dedupe_ids`]); synthesized ids never collide with
/// them.
pub fn merge_detections(
    primary: Vec<DetectedComponent>,
    secondary: &[SecondaryDetection],
) -> MergeOutcome {
    let mut consumed = vec![false; secondary.len()];
    let mut matched = 0;
    let mut components = Vec::with_capacity(primary.len() + secondary.len());

    for mut component in primary {
        let hit = secondary
            .iter()
            .enumerate()
            .find(|(i, d)| !consumed[*i] && d.type_code == component.component_type)
            .map(|(i, _)| i);

        match hit {
            Some(i) => {
                consumed[i] = true;
                component.mark_hybrid(secondary[i].confidence);
                matched += 1;
            }
            None => component.mark_primary(),
        }
        components.push(component);
    }

    let mut taken: HashSet<String> = components.iter().map(|c| c.id.clone()).collect();
    let mut added = 0;
    let mut discarded = 0;

    for (i, detection) in secondary.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        if detection.confidence >= SECONDARY_ONLY_MIN_CONFIDENCE {
            components.push(synthesize(i, detection, &mut taken));
            added += 1;
        } else {
            discarded += 1;
        }
    }

    MergeOutcome {
        components,
        matched,
        added,
        discarded,
    }
}

/// Build a `secondary` component from an unmatched detection.
fn synthesize(
    index: usize,
    detection: &SecondaryDetection,
    taken: &mut HashSet<String>,
) -> DetectedComponent {
    let base = format!("secondary-{}-{}", detection.type_code, index + 1);
    let id = unique_id(&base, taken);
    let name = humanize_label(&detection.label);

    let mut component = DetectedComponent::new(id, name, detection.type_code).with_description(
        format!(
            "Detected visually as '{}' (confidence {:.2})",
            detection.label, detection.confidence
        ),
    );
    component.provenance = Provenance::Secondary;
    component.secondary_confidence = Some(detection.confidence);
    component
}

/// Reserve `base` (or `base-2`, `base-3`, ...) in `taken` and return it.
pub(crate) fn unique_id(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// `load_balancer` -> `Load Balancer`.
pub fn humanize_label(label: &str) -> String {
    label
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
