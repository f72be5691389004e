//! Fleet status aggregation

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use kunit_common::crd::{SyncStatus, Unit, UnitPhase, UnitSet, UnitSetStatus};
use kunit_common::naming;
use kunit_common::quantity::quantity_gt;

use crate::rollout::is_stale;
use crate::template::unit_main_container;

fn resources_synced(us: &UnitSet, unit: &Unit) -> bool {
    let Some(declared) = us.spec.resources.as_ref() else {
        return true;
    };
    unit_main_container(unit).is_some_and(|c| c.resources.as_ref() == Some(declared))
}

fn claims_synced(us: &UnitSet, unit: &Unit) -> bool {
    let observed = unit
        .status
        .as_ref()
        .map(|s| s.persistent_volume_claim.as_slice())
        .unwrap_or_default();
    let unit_name = unit.name_any();
    us.spec.storages.iter().all(|storage| {
        let claim = naming::claim_name(&storage.name, &unit_name);
        observed
            .iter()
            .find(|c| c.name == claim)
            .and_then(|c| c.capacity.clone())
            .is_some_and(|capacity| {
                !quantity_gt(&Quantity(storage.size.clone()), &Quantity(capacity))
            })
    })
}

/// Compute the fleet status from its units.
///
/// Each sync flag requires the full declared count of units to agree. Image
/// sync also requires every unit to carry the fleet template's hash.
pub fn build_status(
    us: &UnitSet,
    units: &[Unit],
    template_hash: Option<&str>,
    in_update: &str,
) -> UnitSetStatus {
    let previous = us.status.as_ref();
    let complete = units.len() as u32 == us.spec.units;

    let image_synced = complete
        && units
            .iter()
            .all(|u| !is_stale(u, &us.spec.version, template_hash));
    let resource_synced = complete && units.iter().all(|u| resources_synced(us, u));
    let pvc_synced = complete && units.iter().all(|u| claims_synced(us, u));

    UnitSetStatus {
        units: units.len() as u32,
        ready_units: units
            .iter()
            .filter(|u| u.status.as_ref().is_some_and(|s| s.phase == UnitPhase::Ready))
            .count() as u32,
        image_sync_status: SyncStatus::transition(
            previous.map(|s| &s.image_sync_status),
            image_synced,
        ),
        resource_sync_status: SyncStatus::transition(
            previous.map(|s| &s.resource_sync_status),
            resource_synced,
        ),
        pvc_sync_status: SyncStatus::transition(previous.map(|s| &s.pvc_sync_status), pvc_synced),
        in_update: in_update.to_string(),
        observed_generation: us.metadata.generation,
    }
}
