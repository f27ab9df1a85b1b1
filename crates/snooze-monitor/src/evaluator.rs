//! The idle rule: every thresholded kind must be at or below its limit.

use std::collections::HashMap;

use snooze_core::{ResourceSample, ResourceType};

/// A host is idle when, for every kind with a configured threshold, the
/// latest sample is at or below that threshold. Kinds without thresholds
/// are ignored. A thresholded kind with no sample yet blocks idleness:
/// we never declare a host idle on missing evidence.
pub fn is_idle(
    thresholds: &HashMap<ResourceType, f64>,
    usage: &HashMap<ResourceType, ResourceSample>,
) -> bool {
    if thresholds.is_empty() {
        return false;
    }

    thresholds.iter().all(|(kind, threshold)| {
        usage
            .get(kind)
            .map(|sample| sample.value <= *threshold)
            .unwrap_or(false)
    })
}
