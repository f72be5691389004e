//! Rolling update planning
//!
//! Units are updated highest ordinal first, only at or above the partition,
//! `maxUnavailable` at a time. A unit is stale when its main-container-version
//! stamp differs from the declared version or its template-hash stamp differs
//! from the fleet template's; both stamps are written only after the unit
//! reported Ready on the new template.

use kube::ResourceExt;

use kunit_common::crd::{Unit, UnitSet, UpdateStrategyType};
use kunit_common::kube_utils::is_deleting;
use kunit_common::{
    ANNOTATION_MAIN_CONTAINER_VERSION, ANNOTATION_TEMPLATE_HASH, LABEL_UNIT_ORDINAL,
};

/// Ordinal from the ordinal label; unlabelled units have none
pub fn unit_ordinal(unit: &Unit) -> Option<u32> {
    unit.labels()
        .get(LABEL_UNIT_ORDINAL)
        .and_then(|o| o.parse().ok())
}

/// True when the unit has not been rolled to `version` and the fleet template
/// hashed as `template_hash` yet
pub fn is_stale(unit: &Unit, version: &str, template_hash: Option<&str>) -> bool {
    let annotations = unit.annotations();
    let version_stale =
        annotations.get(ANNOTATION_MAIN_CONTAINER_VERSION).map(String::as_str) != Some(version);
    let content_stale = template_hash.is_some_and(|hash| {
        annotations.get(ANNOTATION_TEMPLATE_HASH).map(String::as_str) != Some(hash)
    });
    version_stale || content_stale
}

/// Batches of unit names to roll, in order.
///
/// Empty when the strategy is `Manual` or nothing is stale.
pub fn plan_batches(
    us: &UnitSet,
    units: &[Unit],
    template_hash: Option<&str>,
) -> Vec<Vec<String>> {
    let strategy = &us.spec.update_strategy;
    if strategy.type_ == UpdateStrategyType::Manual {
        return Vec::new();
    }
    let partition = strategy.rolling_update.partition;
    let batch_size = strategy.rolling_update.max_unavailable.max(1) as usize;

    let mut stale: Vec<(u32, String)> = units
        .iter()
        .filter(|u| !is_deleting(*u))
        .filter(|u| is_stale(u, &us.spec.version, template_hash))
        .filter_map(|u| {
            let ordinal = unit_ordinal(u)?;
            (ordinal >= partition && ordinal < us.spec.units).then(|| (ordinal, u.name_any()))
        })
        .collect();
    stale.sort_by(|a, b| b.0.cmp(&a.0));

    stale
        .chunks(batch_size)
        .map(|chunk| chunk.iter().map(|(_, name)| name.clone()).collect())
        .collect()
}
