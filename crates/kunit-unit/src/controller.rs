//! Unit controller implementation
//!
//! Keeps exactly one pod per Unit, named after the Unit and matching its
//! declaration, without destroying it needlessly. Each pass:
//!
//! 1. Claims: create `{template}-{unit}` when absent, only ever grow storage
//! 2. Pod: create when absent (required onto the pinned node), recreate on
//!    primary-container drift, otherwise patch labels, annotations and sidecar
//!    images in place
//! 3. Node adoption: record the bound node on an unpinned Unit
//! 4. Config sync and process lifecycle through the sidecar agent
//! 5. Status, written only when it changed
//!
//! Deletion is finalizer-gated: the pod goes first, then the claims.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kunit_common::crd::{Unit, UnitStatus};
use kunit_common::deletion::{tear_down, DeletionWait, DependentSet};
use kunit_common::events::{EventPublisher, KubeEventPublisher, KunitEvent};
use kunit_common::fanout::FanOut;
use kunit_common::kube_utils::{
    has_finalizer, ignore_not_found, is_container_ready, is_deleting, is_pod_ready,
    ok_if_not_found, poll_until, with_finalizer, without_finalizer,
};
use kunit_common::quantity::quantity_gt;
use kunit_common::retry::{retry_on_conflict, RetryConfig};
use kunit_common::{
    annotation_enabled, naming, Error, OperatorConfig, AGENT_CONTAINER_NAME,
    ANNOTATION_CONFIG_TEMPLATE_REVISION, ANNOTATION_CONFIG_VALUE_REVISION, ANNOTATION_FORCE_DELETE,
    ANNOTATION_MAINTENANCE, ANNOTATION_NODE_NAME, ANNOTATION_NODE_UNPINNED, FINALIZER_POD_CLEANUP,
    FINALIZER_PVC_CLEANUP, LABEL_UNITSET_NAME, LABEL_UNIT_NAME,
};

use crate::agent::{
    resolve_endpoint, AgentEndpoint, ConfigSyncRequest, HttpSidecarAgent, ProcessState,
    SidecarAgent,
};
use crate::drift::{classify, declared_metadata, primary_container_name, DriftAction};
use crate::status::{build_status, Observed};

/// Name reported on events and used as the field manager suffix
pub const CONTROLLER_NAME: &str = "kunit-unit-controller";

/// Node label matched by a node pin
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed by the Unit controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnitKube: Send + Sync {
    /// Get a Unit
    async fn get_unit(&self, name: &str, namespace: &str) -> Result<Option<Unit>, Error>;

    /// JSON merge patch a Unit (metadata only)
    async fn patch_unit(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error>;

    /// Replace a Unit's status
    async fn patch_unit_status(
        &self,
        name: &str,
        namespace: &str,
        status: &UnitStatus,
    ) -> Result<(), Error>;

    /// Get a pod
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Strategic merge patch a pod
    async fn patch_pod(&self, name: &str, namespace: &str, patch: &Value) -> Result<Pod, Error>;

    /// Delete a pod; absent pods are not an error
    async fn delete_pod(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error>;

    /// Get a claim
    async fn get_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a claim
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error>;

    /// Strategic merge patch a claim
    async fn patch_claim(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error>;

    /// Delete a claim; absent claims are not an error
    async fn delete_claim(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error>;

    /// PersistentVolumes whose claimRef points at `namespace/claim`
    async fn volumes_claimed_by(
        &self,
        claim: &str,
        namespace: &str,
    ) -> Result<Vec<PersistentVolume>, Error>;

    /// Delete a PersistentVolume; absent volumes are not an error
    async fn delete_volume(&self, name: &str) -> Result<(), Error>;

    /// Get a node
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;
}

/// Real Kubernetes client implementation
pub struct UnitKubeImpl {
    client: Client,
}

impl UnitKubeImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Merge patch carrying the whole status; empty fields go out as null or [] so
/// they are cleared on the stored object
fn status_patch(status: &UnitStatus) -> Value {
    json!({ "status": status })
}

fn delete_params(grace_period: Option<u32>) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: grace_period,
        ..DeleteParams::default()
    }
}

#[async_trait]
impl UnitKube for UnitKubeImpl {
    async fn get_unit(&self, name: &str, namespace: &str) -> Result<Option<Unit>, Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn patch_unit(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_unit_status(
        &self,
        name: &str,
        namespace: &str,
        status: &UnitStatus,
    ) -> Result<(), Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch(status)))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn patch_pod(&self, name: &str, namespace: &str, patch: &Value) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?)
    }

    async fn delete_pod(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &delete_params(grace_period)).await)
    }

    async fn get_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), claim).await?;
        Ok(())
    }

    async fn patch_claim(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn delete_claim(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &delete_params(grace_period)).await)
    }

    async fn volumes_claimed_by(
        &self,
        claim: &str,
        namespace: &str,
    ) -> Result<Vec<PersistentVolume>, Error> {
        // claimRef has no field selector, so list and filter
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = api.list(&ListParams::default()).await?;
        Ok(volumes
            .items
            .into_iter()
            .filter(|pv| {
                pv.spec
                    .as_ref()
                    .and_then(|s| s.claim_ref.as_ref())
                    .is_some_and(|r| {
                        r.name.as_deref() == Some(claim) && r.namespace.as_deref() == Some(namespace)
                    })
            })
            .collect())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        ok_if_not_found(api.get(name).await)
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state of the Unit controller
pub struct Context {
    /// Kubernetes operations
    pub kube: Arc<dyn UnitKube>,
    /// Sidecar agent client
    pub agent: Arc<dyn SidecarAgent>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Fires on shutdown and aborts bounded waits
    pub cancel: CancellationToken,
}

impl Context {
    /// Start building a context around a kube client
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder {
            client,
            config: OperatorConfig::default(),
            cancel: CancellationToken::new(),
            agent: None,
        }
    }

    /// Context with mocks, test timings and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn UnitKube>, agent: Arc<dyn SidecarAgent>) -> Self {
        Self {
            kube,
            agent,
            events: Arc::new(kunit_common::events::NoopEventPublisher),
            config: OperatorConfig::for_testing(),
            cancel: CancellationToken::new(),
        }
    }

    fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.config.conflict_retries)
    }

    fn deletion_wait(&self) -> DeletionWait {
        DeletionWait {
            timeout: self.config.delete_timeout,
            poll_interval: self.config.poll_interval,
        }
    }

    async fn publish(&self, unit: &Unit, event: KunitEvent) {
        self.events.record(&unit.object_ref(&()), &event).await;
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
    agent: Option<Arc<dyn SidecarAgent>>,
}

impl ContextBuilder {
    /// Operator configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Shutdown token
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the sidecar agent client
    pub fn agent(mut self, agent: Arc<dyn SidecarAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Build the context
    pub fn build(self) -> Result<Context, Error> {
        let agent = match self.agent {
            Some(agent) => agent,
            None => Arc::new(HttpSidecarAgent::new(self.config.agent_timeout)?),
        };
        Ok(Context {
            kube: Arc::new(UnitKubeImpl::new(self.client.clone())),
            agent,
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            config: self.config,
            cancel: self.cancel,
        })
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Unit
#[instrument(skip(unit, ctx), fields(unit = %unit.name_any()))]
pub async fn reconcile(unit: Arc<Unit>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = unit.name_any();
    let namespace = unit
        .namespace()
        .ok_or_else(|| Error::validation(&name, "Unit is missing a namespace"))?;

    if is_deleting(unit.as_ref()) {
        return finalize(&unit, &name, &namespace, &ctx).await;
    }

    if annotation_enabled(unit.annotations(), ANNOTATION_MAINTENANCE) {
        info!("unit in maintenance, skipping convergence");
        return Ok(Action::requeue(ctx.config.requeue_interval));
    }

    debug!("reconciling unit");
    ensure_finalizers(&unit, &name, &namespace, &ctx).await?;
    reconcile_claims(&unit, &name, &namespace, &ctx).await?;
    let pod = reconcile_pod(&unit, &name, &namespace, &ctx).await?;
    if let Some(pod) = pod.as_ref() {
        adopt_node(&unit, pod, &name, &namespace, &ctx).await?;
    }

    let (status, lifecycle) = observe(&unit, pod.as_ref(), &name, &namespace, &ctx).await?;
    write_status(&unit, &status, &name, &namespace, &ctx).await?;
    lifecycle?;

    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Error policy for the Unit controller.
///
/// Validation errors wait for a spec change; everything else requeues on the
/// fixed error interval. A warning event is published either way.
pub fn error_policy(unit: Arc<Unit>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        unit = %unit.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    let validation = matches!(error, Error::Validation { .. });
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let events = ctx.events.clone();
        let reference = unit.object_ref(&());
        let event = KunitEvent::from_error(error);
        handle.spawn(async move {
            events.record(&reference, &event).await;
        });
    }

    if validation {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.error_requeue_interval)
    }
}

async fn ensure_finalizers(
    unit: &Unit,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if has_finalizer(unit, FINALIZER_POD_CLEANUP) && has_finalizer(unit, FINALIZER_PVC_CLEANUP) {
        return Ok(());
    }

    retry_on_conflict(&ctx.retry(), "add unit finalizers", move || async move {
        let Some(current) = ctx.kube.get_unit(name, namespace).await? else {
            return Ok(());
        };
        let mut finalizers = current.finalizers().to_vec();
        let mut changed = false;
        for finalizer in [FINALIZER_POD_CLEANUP, FINALIZER_PVC_CLEANUP] {
            if let Some(next) = with_finalizer(&finalizers, finalizer) {
                finalizers = next;
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": current.resource_version(),
            }
        });
        ctx.kube.patch_unit(name, namespace, &patch).await?;
        debug!("added unit finalizers");
        Ok(())
    })
    .await
}

async fn remove_finalizer(
    name: &str,
    namespace: &str,
    finalizer: &str,
    ctx: &Context,
) -> Result<(), Error> {
    retry_on_conflict(&ctx.retry(), "remove unit finalizer", move || async move {
        let Some(current) = ctx.kube.get_unit(name, namespace).await? else {
            return Ok(());
        };
        let Some(finalizers) = without_finalizer(current.finalizers(), finalizer) else {
            return Ok(());
        };
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": current.resource_version(),
            }
        });
        ctx.kube.patch_unit(name, namespace, &patch).await
    })
    .await
}

// =============================================================================
// Claims
// =============================================================================

fn requested_storage(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

/// Claim rendered from a volume claim template
pub fn render_claim(
    unit: &Unit,
    template: &PersistentVolumeClaim,
    claim: &str,
    namespace: &str,
) -> PersistentVolumeClaim {
    let mut labels = template.metadata.labels.clone().unwrap_or_default();
    labels.insert(LABEL_UNIT_NAME.to_string(), unit.name_any());
    if let Some(set) = unit.labels().get(LABEL_UNITSET_NAME) {
        labels.insert(LABEL_UNITSET_NAME.to_string(), set.clone());
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: template.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

async fn reconcile_claims(
    unit: &Unit,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let mut tasks = FanOut::new(format!("claims of {}", name));
    for template in &unit.spec.volume_claim_templates {
        let Some(template_name) = template.metadata.name.as_deref() else {
            continue;
        };
        let claim = naming::claim_name(template_name, name);
        tasks.push(claim.clone(), ensure_claim(unit, template, claim, namespace, ctx));
    }
    tasks.run().await
}

async fn ensure_claim(
    unit: &Unit,
    template: &PersistentVolumeClaim,
    claim: String,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let Some(live) = ctx.kube.get_claim(&claim, namespace).await? else {
        let dangling = ctx.kube.volumes_claimed_by(&claim, namespace).await?;
        if let Some(pv) = dangling.first() {
            return Err(Error::precondition(
                &claim,
                format!(
                    "PersistentVolume {} still references {}/{}; release or delete it first",
                    pv.name_any(),
                    namespace,
                    claim
                ),
            ));
        }
        ctx.kube
            .create_claim(namespace, &render_claim(unit, template, &claim, namespace))
            .await?;
        info!(claim = %claim, "created claim");
        return Ok(());
    };

    if let (Some(desired), Some(current)) = (requested_storage(template), requested_storage(&live))
    {
        if quantity_gt(desired, current) {
            let patch = json!({ "spec": { "resources": { "requests": { "storage": desired } } } });
            ctx.kube.patch_claim(&claim, namespace, &patch).await?;
            info!(claim = %claim, from = %current.0, to = %desired.0, "expanded claim");
            ctx.publish(
                unit,
                KunitEvent::StorageExpanded {
                    claim: claim.clone(),
                    from: current.0.clone(),
                    to: desired.0.clone(),
                },
            )
            .await;
        } else if quantity_gt(current, desired) {
            debug!(claim = %claim, "declared storage below live size, claims never shrink");
        }
    }
    Ok(())
}

// =============================================================================
// Pod
// =============================================================================

/// Pod synthesized from the Unit's template
pub fn render_pod(unit: &Unit, name: &str, namespace: &str) -> Pod {
    let (mut labels, annotations) = declared_metadata(unit);
    labels.insert(LABEL_UNIT_NAME.to_string(), name.to_string());

    let mut spec = unit.spec.template.spec.clone().unwrap_or_default();
    spec.hostname = Some(name.to_string());
    if let Some(node) = pinned_node(unit) {
        pin_to_node(&mut spec, node);
    }

    let mut volumes = spec.volumes.take().unwrap_or_default();
    for template in &unit.spec.volume_claim_templates {
        let Some(template_name) = template.metadata.name.as_deref() else {
            continue;
        };
        if volumes.iter().any(|v| v.name == template_name) {
            continue;
        }
        volumes.push(Volume {
            name: template_name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::claim_name(template_name, name),
                read_only: None,
            }),
            ..Default::default()
        });
    }
    spec.volumes = (!volumes.is_empty()).then_some(volumes);

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: unit.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Node the Unit's pod must land on, unless its UnitSet leaves it unpinned
fn pinned_node(unit: &Unit) -> Option<&str> {
    if annotation_enabled(unit.annotations(), ANNOTATION_NODE_UNPINNED) {
        return None;
    }
    unit.annotations()
        .get(ANNOTATION_NODE_NAME)
        .map(String::as_str)
        .filter(|n| !n.is_empty())
}

/// Require `node` in every node selector term, replacing any other hostname pin
fn pin_to_node(spec: &mut PodSpec, node: &str) {
    let pin = NodeSelectorRequirement {
        key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        operator: "In".to_string(),
        values: Some(vec![node.to_string()]),
    };
    let selector = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);
    if selector.node_selector_terms.is_empty() {
        selector.node_selector_terms.push(NodeSelectorTerm::default());
    }
    for term in selector.node_selector_terms.iter_mut() {
        let expressions = term.match_expressions.get_or_insert_with(Vec::new);
        expressions.retain(|e| e.key != HOSTNAME_TOPOLOGY_KEY);
        expressions.push(pin.clone());
    }
}

async fn reconcile_pod(
    unit: &Unit,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Option<Pod>, Error> {
    let Some(pod) = ctx.kube.get_pod(name, namespace).await? else {
        let created = ctx
            .kube
            .create_pod(namespace, &render_pod(unit, name, namespace))
            .await?;
        info!("created pod");
        ctx.publish(
            unit,
            KunitEvent::PodCreated {
                pod: name.to_string(),
            },
        )
        .await;
        return Ok(Some(created));
    };

    if pod.metadata.deletion_timestamp.is_some() {
        debug!("pod is terminating, waiting for a later pass");
        return Ok(Some(pod));
    }

    match classify(unit, &pod) {
        DriftAction::NoOp => Ok(Some(pod)),
        DriftAction::Patch(patch) => {
            debug!(%patch, "patching pod");
            Ok(Some(ctx.kube.patch_pod(name, namespace, &patch).await?))
        }
        DriftAction::Recreate(drift) => {
            let summary = drift
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            info!(reasons = %summary, "recreating pod");
            let created = recreate_pod(unit, &pod, name, namespace, ctx).await?;
            ctx.publish(unit, KunitEvent::PodRecreated { drift: summary }).await;
            Ok(Some(created))
        }
    }
}

async fn recreate_pod(
    unit: &Unit,
    pod: &Pod,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Pod, Error> {
    if is_container_ready(pod, AGENT_CONTAINER_NAME) {
        if let Some(endpoint) = resolve_endpoint(&ctx.config, unit, pod) {
            if let Err(e) = ctx.agent.stop_service(&endpoint).await {
                warn!(error = %e, "agent stop before recreate failed, deleting anyway");
            }
        }
    }

    ctx.kube.delete_pod(name, namespace, None).await?;
    poll_until(
        ctx.config.delete_timeout,
        ctx.config.poll_interval,
        &ctx.cancel,
        format!("deletion of pod {}", name),
        move || async move { Ok(ctx.kube.get_pod(name, namespace).await?.is_none()) },
    )
    .await?;

    ctx.kube
        .create_pod(namespace, &render_pod(unit, name, namespace))
        .await
}

/// Record the node an unpinned Unit's pod is bound to
async fn adopt_node(
    unit: &Unit,
    pod: &Pod,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if unit.annotations().contains_key(ANNOTATION_NODE_NAME)
        || annotation_enabled(unit.annotations(), ANNOTATION_NODE_UNPINNED)
    {
        return Ok(());
    }
    let Some(node) = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
    else {
        return Ok(());
    };

    let patch = json!({ "metadata": { "annotations": { (ANNOTATION_NODE_NAME): node } } });
    ctx.kube.patch_unit(name, namespace, &patch).await?;
    info!(node, "recorded bound node on unit");
    Ok(())
}

// =============================================================================
// Agent interaction and status
// =============================================================================

async fn config_revision(
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<Option<String>, Error> {
    Ok(ctx
        .kube
        .get_config_map(name, namespace)
        .await?
        .and_then(|cm| cm.metadata.resource_version))
}

/// Push config to the agent when the stamped revisions are stale.
///
/// Returns whether the agent has the live revisions.
async fn sync_config(
    unit: &Unit,
    endpoint: Option<&AgentEndpoint>,
    main_container: &str,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<bool, Error> {
    let template_name = unit.spec.config_template_name.as_str();
    let value_name = unit.spec.config_value_name.as_str();
    if template_name.is_empty() || value_name.is_empty() {
        return Ok(true);
    }

    let (template_rev, value_rev) = futures::try_join!(
        config_revision(ctx, template_name, namespace),
        config_revision(ctx, value_name, namespace),
    )?;
    let (Some(template_rev), Some(value_rev)) = (template_rev, value_rev) else {
        debug!(template = template_name, value = value_name, "config maps not present yet");
        return Ok(false);
    };

    let annotations = unit.annotations();
    if annotations.get(ANNOTATION_CONFIG_TEMPLATE_REVISION) == Some(&template_rev)
        && annotations.get(ANNOTATION_CONFIG_VALUE_REVISION) == Some(&value_rev)
    {
        return Ok(true);
    }

    let Some(endpoint) = endpoint else {
        debug!("config stale but agent not ready");
        return Ok(false);
    };

    let request = ConfigSyncRequest {
        template_name: template_name.to_string(),
        value_name: value_name.to_string(),
        main_container: main_container.to_string(),
        extra_config_names: Vec::new(),
    };
    ctx.agent.sync_config(endpoint, &request).await?;

    let patch = json!({
        "metadata": {
            "annotations": {
                (ANNOTATION_CONFIG_TEMPLATE_REVISION): template_rev,
                (ANNOTATION_CONFIG_VALUE_REVISION): value_rev,
            }
        }
    });
    ctx.kube.patch_unit(name, namespace, &patch).await?;
    info!(template = %template_rev, value = %value_rev, "config synced");
    ctx.publish(
        unit,
        KunitEvent::ConfigSynced {
            template: template_name.to_string(),
            value: value_name.to_string(),
        },
    )
    .await;
    Ok(true)
}

/// Start or stop the workload process to match `spec.startup`
async fn drive_lifecycle(
    unit: &Unit,
    pod: &Pod,
    endpoint: &AgentEndpoint,
    main_container: &str,
    state: &ProcessState,
    ctx: &Context,
) -> Result<(), Error> {
    if unit.spec.startup {
        if !is_container_ready(pod, main_container) && !state.is_active() {
            info!(%state, "starting workload process");
            ctx.agent.start_service(endpoint).await?;
        }
    } else if is_pod_ready(pod) || state.is_active() {
        info!(%state, "stopping workload process");
        ctx.agent.stop_service(endpoint).await?;
    }
    Ok(())
}

/// Observe dependents, drive the agent and compute the new status.
///
/// Lifecycle failures are returned separately so the status still lands.
async fn observe(
    unit: &Unit,
    pod: Option<&Pod>,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(UnitStatus, Result<(), Error>), Error> {
    let node = match pod
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
    {
        Some(node) => ctx.kube.get_node(node).await?,
        None => None,
    };

    let claim_names = unit.claim_names();
    let claims: Vec<PersistentVolumeClaim> = try_join_all(
        claim_names
            .iter()
            .map(|claim| ctx.kube.get_claim(claim, namespace)),
    )
    .await?
    .into_iter()
    .flatten()
    .collect();

    let main_container = primary_container_name(unit).unwrap_or_default();
    let endpoint = pod
        .filter(|p| is_container_ready(p, AGENT_CONTAINER_NAME))
        .and_then(|p| resolve_endpoint(&ctx.config, unit, p));

    let config_synced =
        sync_config(unit, endpoint.as_ref(), &main_container, name, namespace, ctx).await?;

    let mut process_state = None;
    let mut lifecycle = Ok(());
    if let (Some(endpoint), Some(pod)) = (endpoint.as_ref(), pod) {
        match ctx.agent.service_state(endpoint).await {
            Ok(state) => {
                lifecycle =
                    drive_lifecycle(unit, pod, endpoint, &main_container, &state, ctx).await;
                process_state = Some(state.to_string());
            }
            Err(e) => warn!(error = %e, "agent status unavailable"),
        }
    }

    let status = build_status(
        unit,
        &Observed {
            pod,
            node: node.as_ref(),
            claims: &claims,
            process_state,
            config_synced,
        },
    );
    Ok((status, lifecycle))
}

async fn write_status(
    unit: &Unit,
    status: &UnitStatus,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if unit.status.as_ref() == Some(status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    retry_on_conflict(&ctx.retry(), "patch unit status", move || async move {
        ctx.kube.patch_unit_status(name, namespace, status).await
    })
    .await?;
    debug!(phase = %status.phase, "updated unit status");
    Ok(())
}

// =============================================================================
// Deletion
// =============================================================================

struct PodDependents<'a> {
    kube: &'a dyn UnitKube,
    name: &'a str,
    namespace: &'a str,
}

#[async_trait]
impl DependentSet for PodDependents<'_> {
    fn finalizer(&self) -> &'static str {
        FINALIZER_POD_CLEANUP
    }

    async fn delete_all(&self, force: bool) -> Result<(), Error> {
        let grace = force.then_some(0);
        self.kube.delete_pod(self.name, self.namespace, grace).await
    }

    async fn remaining(&self) -> Result<usize, Error> {
        Ok(self
            .kube
            .get_pod(self.name, self.namespace)
            .await?
            .map_or(0, |_| 1))
    }
}

struct ClaimDependents<'a> {
    kube: &'a dyn UnitKube,
    namespace: &'a str,
    claims: Vec<String>,
}

impl ClaimDependents<'_> {
    async fn delete_claim(&self, claim: &str, force: bool) -> Result<(), Error> {
        let volumes = if force {
            self.kube.volumes_claimed_by(claim, self.namespace).await?
        } else {
            Vec::new()
        };
        self.kube
            .delete_claim(claim, self.namespace, force.then_some(0))
            .await?;
        for volume in volumes {
            let pv = volume.name_any();
            self.kube.delete_volume(&pv).await?;
            info!(claim = %claim, volume = %pv, "deleted bound volume");
        }
        Ok(())
    }
}

#[async_trait]
impl DependentSet for ClaimDependents<'_> {
    fn finalizer(&self) -> &'static str {
        FINALIZER_PVC_CLEANUP
    }

    async fn delete_all(&self, force: bool) -> Result<(), Error> {
        let mut tasks = FanOut::new("claim deletion");
        for claim in &self.claims {
            tasks.push(claim.clone(), self.delete_claim(claim, force));
        }
        tasks.run().await
    }

    async fn remaining(&self) -> Result<usize, Error> {
        let present = try_join_all(
            self.claims
                .iter()
                .map(|claim| self.kube.get_claim(claim, self.namespace)),
        )
        .await?;
        Ok(present.into_iter().flatten().count())
    }
}

async fn finalize(
    unit: &Unit,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let force = annotation_enabled(unit.annotations(), ANNOTATION_FORCE_DELETE);
    let wait = ctx.deletion_wait();
    info!(force, "unit deleting, tearing down dependents");

    if has_finalizer(unit, FINALIZER_POD_CLEANUP) {
        let pods = PodDependents {
            kube: ctx.kube.as_ref(),
            name,
            namespace,
        };
        tear_down(name, &pods, force, &wait, &ctx.cancel).await?;
        remove_finalizer(name, namespace, FINALIZER_POD_CLEANUP, ctx).await?;
    }

    if has_finalizer(unit, FINALIZER_PVC_CLEANUP) {
        let claims = ClaimDependents {
            kube: ctx.kube.as_ref(),
            namespace,
            claims: unit.claim_names(),
        };
        tear_down(name, &claims, force, &wait, &ctx.cancel).await?;
        remove_finalizer(name, namespace, FINALIZER_PVC_CLEANUP, ctx).await?;
    }

    ctx.publish(
        unit,
        KunitEvent::CleanupComplete {
            dependents: "pod and claims",
            owner: name.to_string(),
        },
    )
    .await;
    Ok(Action::await_change())
}
