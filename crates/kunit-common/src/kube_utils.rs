//! Shared Kubernetes utilities using kube-rs
//!
//! Bounded polling, not-found handling, owner references, pod condition
//! checks and `ApiResource` building for CRDs the operator does not own
//! (cert-manager, prometheus-operator).

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// The "Ready" condition type for pods and nodes
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

// =============================================================================
// Not-found handling
// =============================================================================

/// Turn a 404 from a GET into `None`
pub fn ok_if_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Treat a 404 from a DELETE as success
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Treat a 409 AlreadyExists from a CREATE as success
pub fn ignore_already_exists<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists" => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met, the timeout is reached, or `cancel` fires.
///
/// `check_fn` returns `Ok(true)` when the condition holds, `Ok(false)` to keep
/// polling. Errors from the check are logged and polling continues, the same
/// way a transient API failure should not abort a wait. Cancellation is
/// observed while sleeping, so a cancelled reconcile returns within one
/// scheduling tick rather than after the full timeout.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    let operation = operation.into();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation = %operation, "condition not yet met"),
            Err(e) => trace!(operation = %operation, error = %e, "poll check failed, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(
                operation,
                format!("condition not met after {:?}", timeout),
            ));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

// =============================================================================
// Owner references and finalizers
// =============================================================================

/// Controller owner reference pointing at `owner`
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// True when the object carries the finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// True when the object is being deleted
pub fn is_deleting<K: ResourceExt>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Finalizer list with `finalizer` added, or `None` when already present
pub fn with_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut next = current.to_vec();
    next.push(finalizer.to_string());
    Some(next)
}

/// Finalizer list with `finalizer` removed, or `None` when absent
pub fn without_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        current
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

// =============================================================================
// Pod helpers
// =============================================================================

/// True when the pod's Ready condition is "True"
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
}

/// Status of the named container, if reported
pub fn container_status<'a>(pod: &'a Pod, container: &str) -> Option<&'a ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == container))
}

/// True when the named container is ready and running
pub fn is_container_ready(pod: &Pod, container: &str) -> bool {
    container_status(pod, container).is_some_and(|cs| {
        cs.ready
            && cs
                .state
                .as_ref()
                .is_some_and(|state| state.running.is_some())
    })
}

/// Merge `source` into `target`, returning true if anything changed.
///
/// Keys only present on `target` are kept.
pub fn merge_string_map(
    target: &mut BTreeMap<String, String>,
    source: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (k, v) in source {
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

// =============================================================================
// ApiResource for foreign CRDs
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
pub trait HasApiResource {
    /// Full API version (e.g., "cert-manager.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "Certificate")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion string and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);
    ApiResource::from_gvk_with_plural(&gvk, &pluralize_kind(kind))
}

/// Split "group/version" (or core "version") into its parts
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural of a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}
