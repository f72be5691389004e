//! UnitSet CRD types
//!
//! A `UnitSet` declares a fleet of homogeneous stateful instances. The
//! UnitSet controller expands it into `units` Unit objects named
//! `{name}-{ordinal}` and keeps shared artifacts (config, services,
//! certificates) around them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::SyncStatus;
use crate::quantity::parse_quantity;
use crate::{naming, Error};

// =============================================================================
// Storage
// =============================================================================

/// A persistent volume mounted into every unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Claim template name, also the volume name
    pub name: String,
    /// Requested size (e.g. "10Gi")
    pub size: String,
    /// Storage class; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Mount path in every container
    pub mount_path: String,
}

/// An emptyDir volume mounted into every unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirSpec {
    /// Volume name
    pub name: String,
    /// Size limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Mount path in every container
    pub mount_path: String,
}

/// A secret mounted into every unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    /// Secret name
    pub name: String,
    /// Mount path in every container
    pub mount_path: String,
}

// =============================================================================
// Networking
// =============================================================================

/// Exposure of a service; skipped entirely when `type` is unset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExposure {
    /// Kubernetes service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

impl ServiceExposure {
    /// The declared type, if any
    pub fn service_type(&self) -> Option<&str> {
        self.type_.as_deref().filter(|t| !t.is_empty())
    }
}

// =============================================================================
// Update strategy
// =============================================================================

/// How version changes reach the units
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// Units are updated in ordinal batches gated on readiness
    #[default]
    RollingUpdate,
    /// The fleet template is refreshed but units keep their version
    Manual,
}

/// Rolling update parameters
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Only units with ordinal >= partition are updated
    #[serde(default)]
    pub partition: u32,
    /// Units updated concurrently in one batch
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,
}

impl Default for RollingUpdateSpec {
    fn default() -> Self {
        Self {
            partition: 0,
            max_unavailable: default_max_unavailable(),
        }
    }
}

fn default_max_unavailable() -> u32 {
    1
}

/// Update strategy of a UnitSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Strategy type
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,
    /// Rolling update parameters
    #[serde(default)]
    pub rolling_update: RollingUpdateSpec,
}

// =============================================================================
// Placement
// =============================================================================

/// Required node label for every unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinityPreset {
    /// Node label key
    pub key: String,
    /// Accepted label values
    pub values: Vec<String>,
}

/// Spreading of units across nodes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodAntiAffinity {
    /// No spreading constraint
    #[default]
    #[serde(rename = "")]
    None,
    /// Prefer different nodes
    Soft,
    /// Require different nodes
    Hard,
}

// =============================================================================
// Certificates and monitoring
// =============================================================================

/// Per-unit TLS certificate profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateProfile {
    /// Subject organizations
    #[serde(default)]
    pub organizations: Vec<String>,
    /// Root CA secret referenced by every per-unit issuer
    pub root_secret: String,
}

/// PodMonitor endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitorEndpoint {
    /// Container port name
    pub port: String,
    /// Metrics path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Scrape interval (e.g. "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// prometheus-operator PodMonitor settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitorSpec {
    /// Whether a PodMonitor is maintained
    #[serde(default)]
    pub enabled: bool,
    /// Scrape endpoints
    #[serde(default)]
    pub endpoints: Vec<PodMonitorEndpoint>,
}

// =============================================================================
// CRD
// =============================================================================

/// Declared fleet of stateful workload instances
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kunit.dev",
    version = "v1alpha1",
    kind = "UnitSet",
    plural = "unitsets",
    shortname = "us",
    namespaced,
    status = "UnitSetStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Units","type":"integer","jsonPath":".spec.units"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyUnits"}"#,
    printcolumn = r#"{"name":"InUpdate","type":"string","jsonPath":".status.inUpdate"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnitSetSpec {
    /// Workload type (e.g. "mysql"), selects template families
    #[serde(rename = "type")]
    pub type_: String,

    /// Optional edition (e.g. "community")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,

    /// Workload version (e.g. "8.0.40")
    pub version: String,

    /// Desired number of units
    #[serde(default)]
    pub units: u32,

    /// Resources of the primary container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment for the primary container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Persistent volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storages: Vec<StorageSpec>,

    /// emptyDir volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_dir: Vec<EmptyDirSpec>,

    /// Mounted secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretSpec>,

    /// Fleet service (the headless service always exists)
    #[serde(default)]
    pub service: ServiceExposure,

    /// External service of the fleet
    #[serde(default)]
    pub external_service: ServiceExposure,

    /// One service per unit
    #[serde(default)]
    pub unit_service: ServiceExposure,

    /// How version changes reach the units
    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// Required node labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_affinity_preset: Vec<NodeAffinityPreset>,

    /// Spreading across nodes
    #[serde(default)]
    pub pod_anti_affinity_preset: PodAntiAffinity,

    /// Per-unit certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateProfile>,

    /// PodMonitor settings
    #[serde(default)]
    pub pod_monitor: PodMonitorSpec,
}

impl UnitSetSpec {
    /// Validate the spec
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.type_.trim().is_empty() {
            return Err(Error::validation(name, "spec.type must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(Error::validation(name, "spec.version must not be empty"));
        }
        if self.update_strategy.rolling_update.max_unavailable == 0 {
            return Err(Error::validation(
                name,
                "spec.updateStrategy.rollingUpdate.maxUnavailable must be at least 1",
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for storage in &self.storages {
            if !seen.insert(storage.name.as_str()) {
                return Err(Error::validation(
                    name,
                    format!("duplicate storage name '{}'", storage.name),
                ));
            }
            if parse_quantity(&storage.size).is_none() {
                return Err(Error::validation(
                    name,
                    format!("storage '{}' has invalid size '{}'", storage.name, storage.size),
                ));
            }
        }
        if let Some(cert) = &self.certificate {
            if cert.root_secret.trim().is_empty() {
                return Err(Error::validation(
                    name,
                    "spec.certificate.rootSecret must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Edition, ignoring empty strings
    pub fn edition(&self) -> Option<&str> {
        self.edition.as_deref().filter(|e| !e.is_empty())
    }

    /// Golden pod template name for the declared version
    pub fn global_pod_template(&self) -> String {
        naming::global_pod_template(&self.type_, self.edition(), &self.version)
    }

    /// Global config template name for a version
    pub fn global_config_template(&self, version: &str) -> String {
        naming::global_config_template(&self.type_, self.edition(), version)
    }

    /// Global config value name for a version
    pub fn global_config_value(&self, version: &str) -> String {
        naming::global_config_value(&self.type_, self.edition(), version)
    }
}

/// Observed state of a UnitSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitSetStatus {
    /// Units owned by the set
    #[serde(default)]
    pub units: u32,
    /// Units reporting Ready
    #[serde(default)]
    pub ready_units: u32,
    /// Every unit runs the declared version
    #[serde(default)]
    pub image_sync_status: SyncStatus,
    /// Every unit declares the fleet resources
    #[serde(default)]
    pub resource_sync_status: SyncStatus,
    /// Every unit's claims have the declared size
    #[serde(default)]
    pub pvc_sync_status: SyncStatus,
    /// Unit currently mid-rollout, empty when converged
    #[serde(default)]
    pub in_update: String,
    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl UnitSet {
    /// Unit names this set should own
    pub fn expected_unit_names(&self) -> Vec<String> {
        naming::unit_names(
            self.metadata.name.as_deref().unwrap_or_default(),
            self.spec.units,
        )
    }
}

/// Parse a node-pinning map annotation.
///
/// `Some(node)` pins a unit, `None` marks it intentionally unpinned. Invalid
/// JSON is treated as an empty map so one bad edit never wedges the fleet.
pub fn parse_node_map(annotations: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>> {
    annotations
        .get(crate::ANNOTATION_NODE_NAME_MAP)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}
