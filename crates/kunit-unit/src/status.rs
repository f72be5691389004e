//! Unit status aggregation from pod, node and claims

use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};

use kunit_common::crd::{SyncStatus, Unit, UnitClaimStatus, UnitPhase, UnitStatus};
use kunit_common::kube_utils::{is_pod_ready, CONDITION_READY, STATUS_TRUE};

/// Everything observed about a unit during one pass
#[derive(Default)]
pub struct Observed<'a> {
    /// Live pod
    pub pod: Option<&'a Pod>,
    /// Node the pod is bound to
    pub node: Option<&'a Node>,
    /// Live claims
    pub claims: &'a [PersistentVolumeClaim],
    /// Process state from the agent, when reachable
    pub process_state: Option<String>,
    /// Whether the agent has the current config revisions
    pub config_synced: bool,
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
}

fn claim_status(pvc: &PersistentVolumeClaim) -> UnitClaimStatus {
    let spec = pvc.spec.as_ref();
    let status = pvc.status.as_ref();
    UnitClaimStatus {
        name: pvc.metadata.name.clone().unwrap_or_default(),
        volume_name: spec.and_then(|s| s.volume_name.clone()),
        access_modes: status
            .and_then(|s| s.access_modes.clone())
            .or_else(|| spec.and_then(|s| s.access_modes.clone()))
            .unwrap_or_default(),
        capacity: status
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .map(|q| q.0.clone()),
        phase: status.and_then(|s| s.phase.clone()),
    }
}

/// Compute the unit's status.
///
/// Timestamps of unchanged sync flags are carried over from `previous`.
pub fn build_status(unit: &Unit, observed: &Observed<'_>) -> UnitStatus {
    let previous = unit.status.as_ref();
    let pod_status = observed.pod.and_then(|p| p.status.as_ref());

    let phase = match observed.pod {
        Some(pod) => UnitPhase::from_pod_phase(
            pod_status.and_then(|s| s.phase.as_deref()),
            is_pod_ready(pod),
        ),
        None => UnitPhase::Pending,
    };

    let mut claims: Vec<UnitClaimStatus> = observed.claims.iter().map(claim_status).collect();
    claims.sort_by(|a, b| a.name.cmp(&b.name));

    UnitStatus {
        phase,
        node_name: observed
            .pod
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty()),
        node_ready: observed.node.is_some_and(node_ready),
        host_ip: pod_status.and_then(|s| s.host_ip.clone()),
        pod_ips: pod_status
            .and_then(|s| s.pod_ips.as_ref())
            .map(|ips| ips.iter().map(|ip| ip.ip.clone()).collect())
            .unwrap_or_default(),
        process_state: observed.process_state.clone(),
        config_sync_status: SyncStatus::transition(
            previous.map(|s| &s.config_sync_status),
            observed.config_synced,
        ),
        persistent_volume_claim: claims,
        observed_generation: unit.metadata.generation,
    }
}
