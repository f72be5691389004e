//! Unit rendering from the fleet declaration and the fleet pod template
//!
//! A Unit's pod template is the fleet copy of the golden template plus the
//! fleet's storage, env, resources and placement. Rolling updates merge a
//! freshly rendered template into the live Unit without losing what was
//! customized on the Unit itself.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodAffinityTerm, PodAntiAffinity as K8sPodAntiAffinity, PodTemplate, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use kunit_common::crd::{parse_node_map, PodAntiAffinity, Unit, UnitSet, UnitSpec};
use kunit_common::kube_utils::merge_string_map;
use kunit_common::quantity::optional_quantity_eq;
use kunit_common::{
    naming, Error, ANNOTATION_LAST_APPLIED, ANNOTATION_MAIN_CONTAINER,
    ANNOTATION_MAIN_CONTAINER_VERSION, ANNOTATION_NODE_NAME, ANNOTATION_NODE_UNPINNED,
    ANNOTATION_TEMPLATE_HASH, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUNIT, LABEL_UNITSET_NAME,
    LABEL_UNITSET_TYPE, LABEL_UNIT_ORDINAL,
};

/// Node label used as the anti-affinity topology
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const INTERNAL_ANNOTATION_PREFIX: &str = "kunit.dev/";

/// Labels every object owned by the fleet carries
pub fn fleet_labels(us: &UnitSet) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_UNITSET_NAME.to_string(), us.name_any()),
        (LABEL_UNITSET_TYPE.to_string(), us.spec.type_.clone()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_KUNIT.to_string(),
        ),
    ])
}

/// Metadata of an object owned by the UnitSet
pub fn owned_metadata(us: &UnitSet, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: us.namespace(),
        labels: Some(fleet_labels(us)),
        owner_references: us.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Annotations controlled by kunit itself, never mirrored onto Units
pub fn is_internal_annotation(key: &str) -> bool {
    key.starts_with(INTERNAL_ANNOTATION_PREFIX) || key == ANNOTATION_LAST_APPLIED
}

/// Fleet labels mirrored to every Unit
pub fn propagated_labels(us: &UnitSet) -> BTreeMap<String, String> {
    let mut labels = us.labels().clone();
    labels.extend(fleet_labels(us));
    labels
}

/// Fleet annotations mirrored to every Unit
pub fn propagated_annotations(us: &UnitSet) -> BTreeMap<String, String> {
    us.annotations()
        .iter()
        .filter(|(k, _)| !is_internal_annotation(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Primary container of the fleet pod template
pub fn main_container_name(fleet: &PodTemplate) -> Option<String> {
    if let Some(name) = fleet
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_MAIN_CONTAINER))
    {
        return Some(name.clone());
    }
    fleet
        .template
        .as_ref()?
        .spec
        .as_ref()?
        .containers
        .first()
        .map(|c| c.name.clone())
}

/// Primary container of a Unit's template
pub fn unit_main_container(unit: &Unit) -> Option<&Container> {
    let containers = &unit.spec.template.spec.as_ref()?.containers;
    match unit.annotations().get(ANNOTATION_MAIN_CONTAINER) {
        Some(name) => containers.iter().find(|c| &c.name == name),
        None => containers.first(),
    }
}

fn unit_main_container_mut(unit: &mut Unit) -> Option<&mut Container> {
    let name = unit.annotations().get(ANNOTATION_MAIN_CONTAINER).cloned();
    let containers = &mut unit.spec.template.spec.as_mut()?.containers;
    match name {
        Some(name) => containers.iter_mut().find(|c| c.name == name),
        None => containers.first_mut(),
    }
}

/// Node the map pins `unit` to; `null` entries and missing entries pin nothing
pub fn pinned_node<'a>(node_map: &'a BTreeMap<String, Option<String>>, unit: &str) -> Option<&'a str> {
    node_map.get(unit).and_then(|n| n.as_deref())
}

/// True when the map holds a `null` entry for `unit`
pub fn is_unpinned(node_map: &BTreeMap<String, Option<String>>, unit: &str) -> bool {
    matches!(node_map.get(unit), Some(None))
}

/// Content hash of a pod template: sha256 of its JSON, first 16 bytes in hex
pub fn template_hash(template: &PodTemplateSpec) -> Result<String, Error> {
    let canonical = serde_json::to_vec(template)?;
    let digest = Sha256::digest(&canonical);
    Ok(hex::encode(&digest[..16]))
}

/// Hash stamped on the fleet pod template
pub fn fleet_template_hash(fleet: &PodTemplate) -> Option<&str> {
    fleet
        .metadata
        .annotations
        .as_ref()?
        .get(ANNOTATION_TEMPLATE_HASH)
        .map(String::as_str)
}

/// Affinity from the node presets and the anti-affinity mode.
///
/// The node pin is not part of it: it travels as the Unit's node-name
/// annotation and is applied when the pod is created.
pub fn affinity(us: &UnitSet) -> Option<Affinity> {
    let expressions: Vec<NodeSelectorRequirement> = us
        .spec
        .node_affinity_preset
        .iter()
        .map(|preset| NodeSelectorRequirement {
            key: preset.key.clone(),
            operator: "In".to_string(),
            values: Some(preset.values.clone()),
        })
        .collect();

    let node_affinity = (!expressions.is_empty()).then(|| NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(expressions),
                match_fields: None,
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    });

    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                LABEL_UNITSET_NAME.to_string(),
                us.name_any(),
            )])),
            match_expressions: None,
        }),
        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        ..Default::default()
    };
    let pod_anti_affinity = match us.spec.pod_anti_affinity_preset {
        PodAntiAffinity::None => None,
        PodAntiAffinity::Soft => Some(K8sPodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    pod_affinity_term: term,
                    weight: 100,
                },
            ]),
            required_during_scheduling_ignored_during_execution: None,
        }),
        PodAntiAffinity::Hard => Some(K8sPodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term]),
            preferred_during_scheduling_ignored_during_execution: None,
        }),
    };

    if node_affinity.is_none() && pod_anti_affinity.is_none() {
        return None;
    }
    Some(Affinity {
        node_affinity,
        pod_anti_affinity,
        pod_affinity: None,
    })
}

/// Claim templates for the declared storages
pub fn claim_templates(us: &UnitSet) -> Vec<PersistentVolumeClaim> {
    us.spec
        .storages
        .iter()
        .map(|storage| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(storage.name.clone()),
                labels: Some(fleet_labels(us)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.size.clone()),
                    )])),
                    limits: None,
                }),
                ..Default::default()
            }),
            status: None,
        })
        .collect()
}

/// Layer `overlay` onto `base` by name; overlay entries win, order is kept
pub fn layer_env(base: &[EnvVar], overlay: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = base.to_vec();
    for var in overlay {
        match merged.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

fn push_mount(mounts: &mut Vec<VolumeMount>, name: &str, path: &str, read_only: bool) {
    if mounts.iter().any(|m| m.name == name) {
        return;
    }
    mounts.push(VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    });
}

fn push_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    if !volumes.iter().any(|v| v.name == volume.name) {
        volumes.push(volume);
    }
}

/// Pod template of one Unit
pub fn render_pod_template(us: &UnitSet, unit: &str, fleet: &PodTemplate) -> PodTemplateSpec {
    let set_name = us.name_any();
    let mut template = fleet.template.clone().unwrap_or_default();

    let mut metadata = template.metadata.take().unwrap_or_default();
    let mut labels = metadata.labels.take().unwrap_or_default();
    labels.extend(fleet_labels(us));
    metadata.labels = Some(labels);
    template.metadata = Some(metadata);

    let mut spec = template.spec.take().unwrap_or_default();
    spec.subdomain = Some(naming::headless_service(&set_name));
    spec.service_account_name = Some(naming::service_account(&set_name));
    spec.hostname = Some(unit.to_string());
    spec.affinity = affinity(us);

    let mut volumes = spec.volumes.take().unwrap_or_default();
    for dir in &us.spec.empty_dir {
        push_volume(
            &mut volumes,
            Volume {
                name: dir.name.clone(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: None,
                    size_limit: dir.size.clone().map(Quantity),
                }),
                ..Default::default()
            },
        );
    }
    if let Some(secret) = &us.spec.secret {
        push_volume(
            &mut volumes,
            Volume {
                name: secret.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }
    spec.volumes = (!volumes.is_empty()).then_some(volumes);

    let main = main_container_name(fleet);
    if let Some(container) = spec
        .containers
        .iter_mut()
        .find(|c| Some(&c.name) == main.as_ref())
    {
        if let Some(resources) = &us.spec.resources {
            container.resources = Some(resources.clone());
        }
        let env = layer_env(container.env.as_deref().unwrap_or_default(), &us.spec.env);
        container.env = (!env.is_empty()).then_some(env);

        let mut mounts = container.volume_mounts.take().unwrap_or_default();
        for storage in &us.spec.storages {
            push_mount(&mut mounts, &storage.name, &storage.mount_path, false);
        }
        for dir in &us.spec.empty_dir {
            push_mount(&mut mounts, &dir.name, &dir.mount_path, false);
        }
        if let Some(secret) = &us.spec.secret {
            push_mount(&mut mounts, &secret.name, &secret.mount_path, true);
        }
        container.volume_mounts = (!mounts.is_empty()).then_some(mounts);
    }

    template.spec = Some(spec);
    template
}

/// Unit `ordinal` of the fleet, ready to create
pub fn render_unit(
    us: &UnitSet,
    ordinal: u32,
    fleet: &PodTemplate,
    node_map: &BTreeMap<String, Option<String>>,
) -> Unit {
    let set_name = us.name_any();
    let name = naming::unit_name(&set_name, ordinal);
    let pin = pinned_node(node_map, &name);

    let mut labels = propagated_labels(us);
    labels.insert(LABEL_UNIT_ORDINAL.to_string(), ordinal.to_string());

    let mut annotations = propagated_annotations(us);
    annotations.insert(
        ANNOTATION_MAIN_CONTAINER_VERSION.to_string(),
        us.spec.version.clone(),
    );
    if let Some(main) = main_container_name(fleet) {
        annotations.insert(ANNOTATION_MAIN_CONTAINER.to_string(), main);
    }
    if let Some(hash) = fleet_template_hash(fleet) {
        annotations.insert(ANNOTATION_TEMPLATE_HASH.to_string(), hash.to_string());
    }
    if let Some(node) = pin {
        annotations.insert(ANNOTATION_NODE_NAME.to_string(), node.to_string());
    } else if is_unpinned(node_map, &name) {
        annotations.insert(ANNOTATION_NODE_UNPINNED.to_string(), "true".to_string());
    }

    let mut unit = Unit::new(
        &name,
        UnitSpec {
            startup: true,
            config_template_name: naming::unitset_config_template(&set_name),
            config_value_name: naming::unit_config_value(&name),
            template: render_pod_template(us, &name, fleet),
            volume_claim_templates: claim_templates(us),
        },
    );
    unit.metadata.namespace = us.namespace();
    unit.metadata.labels = Some(labels);
    unit.metadata.annotations = Some(annotations);
    unit.metadata.owner_references = us.controller_owner_ref(&()).map(|r| vec![r]);
    unit
}

fn union_by_name<T: Clone>(keep: &[T], add: &[T], name: impl Fn(&T) -> &str) -> Vec<T> {
    let mut merged = keep.to_vec();
    for item in add {
        if !merged.iter().any(|m| name(m) == name(item)) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Merge a freshly rendered template into the Unit's current one.
///
/// Images, commands, probes and ports come from `incoming`. Subdomain, service
/// account, hostname and affinity stay as they are on the Unit. Volumes and
/// mounts keep the Unit's entries and gain new ones.
/// Env is layered with the incoming values on top, so only names the Unit
/// alone declares keep their Unit value. Resources are left to the resource
/// propagation pass.
pub fn merge_template(current: &PodTemplateSpec, incoming: &PodTemplateSpec) -> PodTemplateSpec {
    let mut merged = incoming.clone();
    let current_spec = current.spec.clone().unwrap_or_default();

    let mut metadata = merged.metadata.take().unwrap_or_default();
    let current_meta = current.metadata.clone().unwrap_or_default();
    let mut labels = current_meta.labels.unwrap_or_default();
    labels.extend(metadata.labels.take().unwrap_or_default());
    metadata.labels = (!labels.is_empty()).then_some(labels);
    let mut annotations = current_meta.annotations.unwrap_or_default();
    annotations.extend(metadata.annotations.take().unwrap_or_default());
    metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    merged.metadata = Some(metadata);

    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.subdomain = current_spec.subdomain.clone();
    spec.service_account_name = current_spec.service_account_name.clone();
    spec.hostname = current_spec.hostname.clone();
    spec.affinity = current_spec.affinity.clone();

    let volumes = union_by_name(
        current_spec.volumes.as_deref().unwrap_or_default(),
        spec.volumes.as_deref().unwrap_or_default(),
        |v: &Volume| v.name.as_str(),
    );
    spec.volumes = (!volumes.is_empty()).then_some(volumes);

    for container in spec.containers.iter_mut() {
        let Some(old) = current_spec
            .containers
            .iter()
            .find(|c| c.name == container.name)
        else {
            continue;
        };
        let mounts = union_by_name(
            old.volume_mounts.as_deref().unwrap_or_default(),
            container.volume_mounts.as_deref().unwrap_or_default(),
            |m: &VolumeMount| m.name.as_str(),
        );
        container.volume_mounts = (!mounts.is_empty()).then_some(mounts);

        let env = layer_env(
            old.env.as_deref().unwrap_or_default(),
            container.env.as_deref().unwrap_or_default(),
        );
        container.env = (!env.is_empty()).then_some(env);
        container.resources = old.resources.clone();
    }

    merged
}

/// Apply fleet-derived fields that roll out without the readiness gate:
/// labels, annotations, the unpinned mark, primary container env and
/// resources, and claim sizes.
///
/// Returns true when the Unit changed.
pub fn apply_fleet_shape(us: &UnitSet, unit: &mut Unit) -> bool {
    let mut changed = false;
    let unpinned = is_unpinned(&parse_node_map(us.annotations()), &unit.name_any());

    let labels = unit.metadata.labels.get_or_insert_with(BTreeMap::new);
    changed |= merge_string_map(labels, &propagated_labels(us));
    let annotations = unit.metadata.annotations.get_or_insert_with(BTreeMap::new);
    changed |= merge_string_map(annotations, &propagated_annotations(us));
    if unpinned {
        changed |= annotations.remove(ANNOTATION_NODE_NAME).is_some();
        if annotations.get(ANNOTATION_NODE_UNPINNED).map(String::as_str) != Some("true") {
            annotations.insert(ANNOTATION_NODE_UNPINNED.to_string(), "true".to_string());
            changed = true;
        }
    } else {
        changed |= annotations.remove(ANNOTATION_NODE_UNPINNED).is_some();
    }

    if let Some(container) = unit_main_container_mut(unit) {
        let current = container.env.clone().unwrap_or_default();
        let env = layer_env(&current, &us.spec.env);
        if env != current {
            container.env = Some(env);
            changed = true;
        }
        if let Some(resources) = &us.spec.resources {
            if container.resources.as_ref() != Some(resources) {
                container.resources = Some(resources.clone());
                changed = true;
            }
        }
    }

    for storage in &us.spec.storages {
        let Some(template) = unit
            .spec
            .volume_claim_templates
            .iter_mut()
            .find(|t| t.metadata.name.as_deref() == Some(storage.name.as_str()))
        else {
            continue;
        };
        let desired = Quantity(storage.size.clone());
        let requests = template
            .spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(BTreeMap::new);
        if !optional_quantity_eq(requests.get("storage"), Some(&desired)) {
            requests.insert("storage".to_string(), desired);
            changed = true;
        }
    }

    changed
}
