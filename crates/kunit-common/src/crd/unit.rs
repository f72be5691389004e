//! Unit CRD types
//!
//! A `Unit` is one instance of a fleet: exactly one pod named after the Unit
//! plus the claims rendered from its volume claim templates.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::SyncStatus;
use crate::naming;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a Unit, mirrored from its pod
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UnitPhase {
    /// Pod absent or not yet scheduled
    #[default]
    Pending,
    /// Pod running but not ready
    Running,
    /// Pod running and ready
    Ready,
    /// Pod terminated successfully
    Succeeded,
    /// Pod terminated with failure
    Failed,
    /// Pod state could not be determined
    Unknown,
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Ready => write!(f, "Ready"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl UnitPhase {
    /// Map a pod phase string, upgrading Running to Ready when the pod is ready
    pub fn from_pod_phase(phase: Option<&str>, ready: bool) -> Self {
        match phase {
            Some("Pending") | None => Self::Pending,
            Some("Running") if ready => Self::Ready,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some(_) => Self::Unknown,
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// One stateful instance owned by a UnitSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kunit.dev",
    version = "v1alpha1",
    kind = "Unit",
    plural = "units",
    shortname = "un",
    namespaced,
    status = "UnitStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Process","type":"string","jsonPath":".status.processState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Whether the workload process should be running
    #[serde(default)]
    pub startup: bool,

    /// Fleet config template the agent renders from
    #[serde(default)]
    pub config_template_name: String,

    /// Per-unit config value ConfigMap
    #[serde(default)]
    pub config_value_name: String,

    /// Pod template of this instance
    pub template: PodTemplateSpec,

    /// Claims created as `{template}-{unit}`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

/// Observed claim of a Unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitClaimStatus {
    /// Claim name
    pub name: String,
    /// Bound volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    /// Access modes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    /// Provisioned storage capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    /// Claim phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Observed state of a Unit.
///
/// Equality ignores sync timestamps, so an unchanged status compares equal and
/// is not rewritten. Empty fields serialize as `null` or `[]` so a merge patch
/// of the whole status clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: UnitPhase,
    /// Node the pod is bound to
    #[serde(default)]
    pub node_name: Option<String>,
    /// Whether that node reports Ready
    #[serde(default)]
    pub node_ready: bool,
    /// Host IP of the pod
    #[serde(default, rename = "hostIP")]
    pub host_ip: Option<String>,
    /// Pod IPs
    #[serde(default, rename = "podIPs")]
    pub pod_ips: Vec<String>,
    /// Process state reported by the sidecar agent
    #[serde(default)]
    pub process_state: Option<String>,
    /// Whether the agent has the current config revisions
    #[serde(default)]
    pub config_sync_status: SyncStatus,
    /// Claims of this unit
    #[serde(default)]
    pub persistent_volume_claim: Vec<UnitClaimStatus>,
    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl Unit {
    /// Claim names rendered from the volume claim templates
    pub fn claim_names(&self) -> Vec<String> {
        let unit = self.metadata.name.as_deref().unwrap_or_default();
        self.spec
            .volume_claim_templates
            .iter()
            .filter_map(|t| t.metadata.name.as_deref())
            .map(|t| naming::claim_name(t, unit))
            .collect()
    }

    /// True when the status reflects the current spec and the pod is ready
    pub fn is_ready_for_generation(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        match (status.observed_generation, self.metadata.generation) {
            (Some(observed), Some(generation)) => {
                observed >= generation && status.phase == UnitPhase::Ready
            }
            _ => false,
        }
    }
}
