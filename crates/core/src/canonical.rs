//! Sanitation of the canonical component list.
//!
//! The Primary Detector's output is model-generated and may repeat ids,
//! omit them, or reference components that were never emitted. These
//! helpers bring the list back in line with the data-model invariants:
//! unique ids, connections between known components only, and
//! `replicaOf` pointing at a component that exists.

use std::collections::HashSet;

use crate::component::{DetectedComponent, DetectedConnection};
use crate::merge::unique_id;

/// Make every component id unique, in place.
///
/// The first occurrence of an id keeps it; later duplicates become
/// `<id>-2`, `<id>-3`, ... Blank ids are replaced by `component-<n>`
/// where `n` is the 1-based list position. Returns how many ids changed.
pub fn dedupe_ids(components: &mut [DetectedComponent]) -> usize {
    let mut taken = HashSet::with_capacity(components.len());
    let mut renamed = 0;

    for (index, component) in components.iter_mut().enumerate() {
        let trimmed = component.id.trim();
        let base = if trimmed.is_empty() {
            format!("component-{}", index + 1)
        } else {
            trimmed.to_string()
        };

        let id = unique_id(&base, &mut taken);
        if id != component.id {
            component.id = id;
            renamed += 1;
        }
    }

    renamed
}

/// Keep only connections whose endpoints are both canonical component ids.
pub fn retain_known_connections(
    connections: &mut Vec<DetectedConnection>,
    components: &[DetectedComponent],
) -> usize {
    let known: HashSet<&str> = components.iter().map(|c| c.id.as_str()).collect();
    let before = connections.len();
    connections.retain(|c| known.contains(c.from.as_str()) && known.contains(c.to.as_str()));
    before - connections.len()
}

/// Clear `replicaOf` references to unknown ids or to the component itself.
pub fn clear_dangling_replicas(components: &mut [DetectedComponent]) -> usize {
    let known: HashSet<String> = components.iter().map(|c| c.id.clone()).collect();
    let mut cleared = 0;

    for component in components.iter_mut() {
        let dangling = match component.replica_of.as_deref() {
            Some(target) => target == component.id || !known.contains(target),
            None => false,
        };
        if dangling {
            component.replica_of = None;
            cleared += 1;
        }
    }

    cleared
}
