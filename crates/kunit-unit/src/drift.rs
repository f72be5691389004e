//! Drift detection between a Unit's declared pod and the live pod
//!
//! Only the primary container can force a recreate. Everything else the Unit
//! owns on the pod (labels, annotations, sidecar images) is converged in place
//! with a strategic merge patch that carries only the changed keys.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};
use serde_json::{json, Map, Value};

use kunit_common::crd::Unit;
use kunit_common::quantity::optional_quantity_eq;
use kunit_common::{ANNOTATION_LAST_APPLIED, ANNOTATION_MAIN_CONTAINER};

const TRACKED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// Why a live pod cannot be patched into shape
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecreateReason {
    /// Primary container runs a different image
    Image {
        /// Declared image
        desired: String,
        /// Live image
        live: String,
    },
    /// A CPU or memory request/limit differs
    Resources(String),
    /// Environment of the primary container differs
    Env(String),
    /// Pod was rejected by its node's affinity check
    NodeAffinityFailure(String),
}

impl std::fmt::Display for RecreateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image { desired, live } => write!(f, "image {} -> {}", live, desired),
            Self::Resources(detail) => write!(f, "resources: {}", detail),
            Self::Env(detail) => write!(f, "env: {}", detail),
            Self::NodeAffinityFailure(node) => write!(f, "node affinity failure on {}", node),
        }
    }
}

/// Outcome of comparing a Unit with its pod
#[derive(Clone, Debug, PartialEq)]
pub enum DriftAction {
    /// Pod matches
    NoOp,
    /// Pod can be converged with this strategic merge patch
    Patch(Value),
    /// Pod must be deleted and created again
    Recreate(Vec<RecreateReason>),
}

/// Name of the primary container: annotation, else the first container
pub fn primary_container_name(unit: &Unit) -> Option<String> {
    if let Some(name) = unit
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_MAIN_CONTAINER))
        .filter(|n| !n.is_empty())
    {
        return Some(name.clone());
    }
    unit.spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
}

/// Classify the delta between the Unit and its live pod.
///
/// Recreate takes precedence over patch.
pub fn classify(unit: &Unit, pod: &Pod) -> DriftAction {
    let main = primary_container_name(unit);
    let desired = declared_containers(unit);
    let live = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let mut reasons = Vec::new();
    if let Some(main) = main.as_deref() {
        let desired_main = desired.iter().find(|c| c.name == main);
        let live_main = live.iter().find(|c| c.name == main);
        if let (Some(d), Some(l)) = (desired_main, live_main) {
            reasons.extend(container_drift(d, l));
        }
    }
    if let Some(node) = node_affinity_failure(pod) {
        reasons.push(RecreateReason::NodeAffinityFailure(node));
    }
    if !reasons.is_empty() {
        return DriftAction::Recreate(reasons);
    }

    match build_patch(unit, pod, main.as_deref(), desired, live) {
        Some(patch) => DriftAction::Patch(patch),
        None => DriftAction::NoOp,
    }
}

fn declared_containers(unit: &Unit) -> &[Container] {
    unit.spec
        .template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

/// Reasons the primary container must be recreated
pub fn container_drift(desired: &Container, live: &Container) -> Vec<RecreateReason> {
    let mut reasons = Vec::new();

    let desired_image = desired.image.clone().unwrap_or_default();
    let live_image = live.image.clone().unwrap_or_default();
    if desired_image != live_image {
        reasons.push(RecreateReason::Image {
            desired: desired_image,
            live: live_image,
        });
    }

    if let Some(detail) = resource_drift(desired, live) {
        reasons.push(RecreateReason::Resources(detail));
    }

    if let Some(detail) = env_drift(
        desired.env.as_deref().unwrap_or_default(),
        live.env.as_deref().unwrap_or_default(),
    ) {
        reasons.push(RecreateReason::Env(detail));
    }

    reasons
}

fn resource_drift(desired: &Container, live: &Container) -> Option<String> {
    let desired = desired.resources.clone().unwrap_or_default();
    let live = live.resources.clone().unwrap_or_default();

    for (kind, want, have) in [
        ("requests", desired.requests.as_ref(), live.requests.as_ref()),
        ("limits", desired.limits.as_ref(), live.limits.as_ref()),
    ] {
        for resource in TRACKED_RESOURCES {
            let w = want.and_then(|m| m.get(resource));
            let h = have.and_then(|m| m.get(resource));
            if !optional_quantity_eq(w, h) {
                return Some(format!(
                    "{}.{} {} -> {}",
                    kind,
                    resource,
                    h.map(|q| q.0.as_str()).unwrap_or("unset"),
                    w.map(|q| q.0.as_str()).unwrap_or("unset"),
                ));
            }
        }
    }
    None
}

/// First env difference: missing or extra names, differing literals or sources
pub fn env_drift(desired: &[EnvVar], live: &[EnvVar]) -> Option<String> {
    let desired: BTreeMap<&str, &EnvVar> = desired.iter().map(|e| (e.name.as_str(), e)).collect();
    let live: BTreeMap<&str, &EnvVar> = live.iter().map(|e| (e.name.as_str(), e)).collect();

    for (name, want) in &desired {
        let Some(have) = live.get(name) else {
            return Some(format!("{} missing", name));
        };
        if want.value.as_deref().unwrap_or_default() != have.value.as_deref().unwrap_or_default()
        {
            return Some(format!("{} value changed", name));
        }
        if want.value_from != have.value_from {
            return Some(format!("{} valueFrom changed", name));
        }
    }
    live.keys()
        .find(|name| !desired.contains_key(*name))
        .map(|name| format!("{} not declared", name))
}

/// Node name when the pod failed its node's affinity admission while bound
fn node_affinity_failure(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Failed") || status.reason.as_deref() != Some("NodeAffinity")
    {
        return None;
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .filter(|n| !n.is_empty())
}

/// Labels and annotations a Unit declares onto its pod
pub fn declared_metadata(unit: &Unit) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let template_meta = unit.spec.template.metadata.clone().unwrap_or_default();
    let mut labels = template_meta.labels.unwrap_or_default();
    labels.extend(unit.metadata.labels.clone().unwrap_or_default());

    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.extend(unit.metadata.annotations.clone().unwrap_or_default());
    annotations.remove(ANNOTATION_LAST_APPLIED);

    (labels, annotations)
}

fn changed_keys(
    declared: &BTreeMap<String, String>,
    live: Option<&BTreeMap<String, String>>,
) -> Map<String, Value> {
    declared
        .iter()
        .filter(|(k, v)| live.and_then(|m| m.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Minimal strategic merge patch, or `None` when nothing differs
fn build_patch(
    unit: &Unit,
    pod: &Pod,
    main: Option<&str>,
    desired: &[Container],
    live: &[Container],
) -> Option<Value> {
    let (labels, annotations) = declared_metadata(unit);
    let label_patch = changed_keys(&labels, pod.metadata.labels.as_ref());
    let annotation_patch = changed_keys(&annotations, pod.metadata.annotations.as_ref());

    let image_patch: Vec<Value> = desired
        .iter()
        .filter(|c| Some(c.name.as_str()) != main)
        .filter_map(|want| {
            let have = live.iter().find(|c| c.name == want.name)?;
            (want.image.is_some() && want.image != have.image)
                .then(|| json!({ "name": want.name, "image": want.image }))
        })
        .collect();

    let mut metadata = Map::new();
    if !label_patch.is_empty() {
        metadata.insert("labels".to_string(), Value::Object(label_patch));
    }
    if !annotation_patch.is_empty() {
        metadata.insert("annotations".to_string(), Value::Object(annotation_patch));
    }

    let mut patch = Map::new();
    if !metadata.is_empty() {
        patch.insert("metadata".to_string(), Value::Object(metadata));
    }
    if !image_patch.is_empty() {
        patch.insert("spec".to_string(), json!({ "containers": image_patch }));
    }

    (!patch.is_empty()).then_some(Value::Object(patch))
}
