//! Shared fleet artifacts beyond Units and services
//!
//! Typed structs for the cert-manager and prometheus-operator resources the
//! fleet owns, plus the service account and role its pods run as. The foreign
//! resources implement `HasApiResource` and are applied as `DynamicObject`s.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use kunit_common::crd::{CertificateProfile, PodMonitorEndpoint, UnitSet};
use kunit_common::kube_utils::HasApiResource;
use kunit_common::{naming, Error, LABEL_UNITSET_NAME};

use crate::template::owned_metadata;

/// Convert a typed foreign resource into a `DynamicObject`
pub fn to_dynamic<T: Serialize>(resource: &T) -> Result<DynamicObject, Error> {
    let value = serde_json::to_value(resource)?;
    Ok(serde_json::from_value(value)?)
}

// =============================================================================
// cert-manager
// =============================================================================

/// cert-manager Issuer backed by a CA secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Issuer spec
    pub spec: IssuerSpec,
}

impl HasApiResource for Issuer {
    const API_VERSION: &'static str = "cert-manager.io/v1";
    const KIND: &'static str = "Issuer";
}

/// Issuer spec (CA issuers only)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    /// CA configuration
    pub ca: CaIssuer,
}

/// CA issuer configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    /// Secret holding the CA key pair
    pub secret_name: String,
}

/// cert-manager Certificate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Certificate spec
    pub spec: CertificateSpec,
}

impl HasApiResource for Certificate {
    const API_VERSION: &'static str = "cert-manager.io/v1";
    const KIND: &'static str = "Certificate";
}

/// Certificate spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Secret the signed certificate is written to
    pub secret_name: String,
    /// Subject common name
    pub common_name: String,
    /// Subject alternative names
    pub dns_names: Vec<String>,
    /// Subject fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<CertificateSubject>,
    /// Issuer reference
    pub issuer_ref: IssuerRef,
}

/// Certificate subject
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSubject {
    /// Organizations
    pub organizations: Vec<String>,
}

/// Reference to an issuer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind
    pub kind: String,
}

/// Issuer of one unit, signing with the fleet's root CA
pub fn unit_issuer(us: &UnitSet, unit: &str, profile: &CertificateProfile) -> Issuer {
    Issuer {
        api_version: Issuer::API_VERSION.to_string(),
        kind: Issuer::KIND.to_string(),
        metadata: owned_metadata(us, &naming::unit_issuer(unit)),
        spec: IssuerSpec {
            ca: CaIssuer {
                secret_name: profile.root_secret.clone(),
            },
        },
    }
}

/// Serving certificate of one unit
pub fn unit_certificate(us: &UnitSet, unit: &str, profile: &CertificateProfile) -> Certificate {
    let name = naming::unit_certificate(unit);
    Certificate {
        api_version: Certificate::API_VERSION.to_string(),
        kind: Certificate::KIND.to_string(),
        metadata: owned_metadata(us, &name),
        spec: CertificateSpec {
            secret_name: name,
            common_name: unit.to_string(),
            dns_names: vec![unit.to_string()],
            subject: (!profile.organizations.is_empty()).then(|| CertificateSubject {
                organizations: profile.organizations.clone(),
            }),
            issuer_ref: IssuerRef {
                name: naming::unit_issuer(unit),
                kind: Issuer::KIND.to_string(),
            },
        },
    }
}

// =============================================================================
// prometheus-operator
// =============================================================================

/// prometheus-operator PodMonitor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitor {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// PodMonitor spec
    pub spec: PodMonitorResourceSpec,
}

impl HasApiResource for PodMonitor {
    const API_VERSION: &'static str = "monitoring.coreos.com/v1";
    const KIND: &'static str = "PodMonitor";
}

/// PodMonitor spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitorResourceSpec {
    /// Pods to scrape
    pub selector: LabelSelector,
    /// Scrape endpoints
    pub pod_metrics_endpoints: Vec<PodMonitorEndpoint>,
}

/// PodMonitor of the fleet, when enabled
pub fn pod_monitor(us: &UnitSet) -> Option<PodMonitor> {
    if !us.spec.pod_monitor.enabled {
        return None;
    }
    Some(PodMonitor {
        api_version: PodMonitor::API_VERSION.to_string(),
        kind: PodMonitor::KIND.to_string(),
        metadata: owned_metadata(us, &us.name_any()),
        spec: PodMonitorResourceSpec {
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    LABEL_UNITSET_NAME.to_string(),
                    us.name_any(),
                )])),
                match_expressions: None,
            },
            pod_metrics_endpoints: us.spec.pod_monitor.endpoints.clone(),
        },
    })
}

// =============================================================================
// Service account and role
// =============================================================================

/// Service account the fleet's pods run as
pub fn service_account(us: &UnitSet) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_metadata(us, &naming::service_account(&us.name_any())),
        ..Default::default()
    }
}

/// Namespaced role of the fleet; the agent reads its config and peers
pub fn role(us: &UnitSet) -> Role {
    let rule = |resources: &[&str], verbs: &[&str]| PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    };
    Role {
        metadata: owned_metadata(us, &naming::service_account(&us.name_any())),
        rules: Some(vec![
            rule(&["configmaps", "secrets"], &["get", "list", "watch"]),
            rule(&["pods", "services", "endpoints"], &["get", "list", "watch"]),
            rule(&["events"], &["create", "patch"]),
        ]),
    }
}

/// Binding of the fleet role to its service account
pub fn role_binding(us: &UnitSet) -> RoleBinding {
    let name = naming::service_account(&us.name_any());
    RoleBinding {
        metadata: owned_metadata(us, &name),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: us.namespace(),
            api_group: None,
        }]),
    }
}
