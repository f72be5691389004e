//! Fleet networking: headless, external and per-unit services
//!
//! Services are created when absent and never mutated. NodePorts handed out
//! by the API server are remembered in UnitSet annotations so that a deleted
//! service comes back on the same ports.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodTemplate, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use kunit_common::crd::UnitSet;
use kunit_common::{
    naming, ANNOTATION_EXTERNAL_NODEPORTS, ANNOTATION_UNIT_NODEPORTS, LABEL_UNITSET_NAME,
    LABEL_UNIT_NAME,
};

use crate::template::owned_metadata;

/// NodePorts of one service, keyed by port name
pub type NodePortMap = BTreeMap<String, i32>;

/// NodePorts of every per-unit service, keyed by unit name
pub type UnitNodePortMap = BTreeMap<String, NodePortMap>;

/// Service ports for every named container port of the fleet template
pub fn container_ports(fleet: &PodTemplate) -> Vec<ServicePort> {
    let Some(spec) = fleet.template.as_ref().and_then(|t| t.spec.as_ref()) else {
        return Vec::new();
    };
    let mut ports: Vec<ServicePort> = Vec::new();
    for container in &spec.containers {
        for port in container.ports.iter().flatten() {
            let name = port
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", container.name, port.container_port));
            if ports.iter().any(|p| p.name.as_deref() == Some(name.as_str())) {
                continue;
            }
            ports.push(ServicePort {
                name: Some(name),
                port: port.container_port,
                target_port: Some(IntOrString::Int(port.container_port)),
                protocol: port.protocol.clone(),
                ..Default::default()
            });
        }
    }
    ports
}

fn uses_node_ports(service_type: &str) -> bool {
    matches!(service_type, "NodePort" | "LoadBalancer")
}

fn with_reservations(mut ports: Vec<ServicePort>, service_type: &str, reserved: &NodePortMap) -> Vec<ServicePort> {
    if !uses_node_ports(service_type) {
        return ports;
    }
    for port in ports.iter_mut() {
        if let Some(node_port) = port.name.as_ref().and_then(|n| reserved.get(n)) {
            port.node_port = Some(*node_port);
        }
    }
    ports
}

fn selector(key: &str, value: String) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(key.to_string(), value)]))
}

/// Headless service giving every unit a stable DNS name
pub fn headless_service(us: &UnitSet, fleet: &PodTemplate) -> Service {
    let set_name = us.name_any();
    Service {
        metadata: owned_metadata(us, &naming::headless_service(&set_name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: selector(LABEL_UNITSET_NAME, set_name),
            ports: Some(container_ports(fleet)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Fleet-wide service, when an external service type is declared
pub fn external_service(us: &UnitSet, fleet: &PodTemplate, reserved: &NodePortMap) -> Option<Service> {
    let service_type = us.spec.external_service.service_type()?;
    let set_name = us.name_any();
    Some(Service {
        metadata: owned_metadata(us, &naming::external_service(&set_name)),
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: selector(LABEL_UNITSET_NAME, set_name),
            ports: Some(with_reservations(container_ports(fleet), service_type, reserved)),
            ..Default::default()
        }),
        status: None,
    })
}

/// Service of a single unit, when a unit service type is declared
pub fn unit_service(
    us: &UnitSet,
    unit: &str,
    fleet: &PodTemplate,
    reserved: &NodePortMap,
) -> Option<Service> {
    let service_type = us.spec.unit_service.service_type()?;
    let mut metadata = owned_metadata(us, &naming::unit_service(unit));
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_UNIT_NAME.to_string(), unit.to_string());
    Some(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: selector(LABEL_UNIT_NAME, unit.to_string()),
            ports: Some(with_reservations(container_ports(fleet), service_type, reserved)),
            ..Default::default()
        }),
        status: None,
    })
}

/// NodePorts the API server allocated to a service
pub fn allocated_node_ports(service: &Service) -> NodePortMap {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|p| Some((p.name.clone()?, p.node_port?)))
        .collect()
}

/// True when the service asks for specific NodePorts
pub fn requests_node_ports(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| ports.iter().any(|p| p.node_port.is_some()))
}

/// External service reservations; invalid JSON reads as none
pub fn external_reservations(annotations: &BTreeMap<String, String>) -> NodePortMap {
    annotations
        .get(ANNOTATION_EXTERNAL_NODEPORTS)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Per-unit service reservations; invalid JSON reads as none
pub fn unit_reservations(annotations: &BTreeMap<String, String>) -> UnitNodePortMap {
    annotations
        .get(ANNOTATION_UNIT_NODEPORTS)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}
