//! Common types for kunit: CRDs, errors, configuration and Kubernetes utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod deletion;
pub mod error;
pub mod events;
pub mod fanout;
pub mod kube_utils;
pub mod naming;
pub mod quantity;
pub mod retry;
pub mod telemetry;

pub use config::{AgentHostType, OperatorConfig};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace holding the global pod/config templates
pub const DEFAULT_MANAGER_NAMESPACE: &str = "kunit-system";

/// Field manager used for server-side writes
pub const FIELD_MANAGER: &str = "kunit-operator";

/// Container name of the in-pod sidecar agent
pub const AGENT_CONTAINER_NAME: &str = "unit-agent";

// =============================================================================
// Labels
// =============================================================================

/// Label carrying the owning UnitSet name (used as the fleet selector)
pub const LABEL_UNITSET_NAME: &str = "kunit.dev/unitset-name";
/// Label carrying the UnitSet workload type
pub const LABEL_UNITSET_TYPE: &str = "kunit.dev/unitset-type";
/// Label carrying a Unit's ordinal within its UnitSet
pub const LABEL_UNIT_ORDINAL: &str = "kunit.dev/unit-ordinal";
/// Label carrying the Unit name on pods and per-unit services
pub const LABEL_UNIT_NAME: &str = "kunit.dev/unit-name";
/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value for the managed-by label
pub const LABEL_MANAGED_BY_KUNIT: &str = "kunit";

// =============================================================================
// Annotations (durable state)
// =============================================================================

/// Name of the primary container inside a Unit's pod
pub const ANNOTATION_MAIN_CONTAINER: &str = "kunit.dev/main-container";
/// Version currently rolled out to a Unit's primary container
pub const ANNOTATION_MAIN_CONTAINER_VERSION: &str = "kunit.dev/main-container-version";
/// Content hash of the pod template rolled out to a Unit or the fleet copy
pub const ANNOTATION_TEMPLATE_HASH: &str = "kunit.dev/template-hash";
/// Version stamp on config/pod template copies
pub const ANNOTATION_CONFIG_VERSION: &str = "kunit.dev/config-version";
/// Config template revision last pushed to a Unit's agent
pub const ANNOTATION_CONFIG_TEMPLATE_REVISION: &str = "kunit.dev/config-template-revision";
/// Config value revision last pushed to a Unit's agent
pub const ANNOTATION_CONFIG_VALUE_REVISION: &str = "kunit.dev/config-value-revision";
/// Node-pinning map on a UnitSet (JSON object unit -> node or null)
pub const ANNOTATION_NODE_NAME_MAP: &str = "kunit.dev/node-name-map";
/// Node a Unit's pod was last bound to
pub const ANNOTATION_NODE_NAME: &str = "kunit.dev/node-name";
/// Set to "true" on a Unit its UnitSet's node map leaves unpinned
pub const ANNOTATION_NODE_UNPINNED: &str = "kunit.dev/node-unpinned";
/// NodePort reservations of the external service (JSON port name -> port)
pub const ANNOTATION_EXTERNAL_NODEPORTS: &str = "kunit.dev/external-nodeports";
/// NodePort reservations of per-unit services (JSON port name -> unit -> port)
pub const ANNOTATION_UNIT_NODEPORTS: &str = "kunit.dev/unit-nodeports";
/// Opt-in to zero-grace deletion including bound PersistentVolumes
pub const ANNOTATION_FORCE_DELETE: &str = "kunit.dev/force-delete";
/// Opt-out of all convergence while an operator works on the object
pub const ANNOTATION_MAINTENANCE: &str = "kunit.dev/maintenance";

/// Annotation written by `kubectl apply`, never propagated
pub const ANNOTATION_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

// =============================================================================
// Finalizers
// =============================================================================

/// UnitSet finalizer guarding its Units
pub const FINALIZER_UNIT_CLEANUP: &str = "kunit.dev/unit-cleanup";
/// UnitSet finalizer guarding its config ConfigMaps
pub const FINALIZER_CONFIG_CLEANUP: &str = "kunit.dev/config-cleanup";
/// Unit finalizer guarding its pod
pub const FINALIZER_POD_CLEANUP: &str = "kunit.dev/pod-cleanup";
/// Unit finalizer guarding its PersistentVolumeClaims
pub const FINALIZER_PVC_CLEANUP: &str = "kunit.dev/pvc-cleanup";

/// Returns true when the annotation is present and set to "true"
pub fn annotation_enabled(
    annotations: &std::collections::BTreeMap<String, String>,
    key: &str,
) -> bool {
    annotations
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
