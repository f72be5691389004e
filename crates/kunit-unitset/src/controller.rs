//! UnitSet controller implementation
//!
//! Keeps exactly `units` Units alive and converged to the fleet declaration.
//! Each pass:
//!
//! 1. Validate the spec, then ensure finalizers and the fleet service account
//! 2. Copy the golden pod template and the config sources into the fleet
//!    namespace, refreshing the template on any content change and the config
//!    on version change
//! 3. Services, certificates and the PodMonitor, created if absent
//! 4. Scale: create missing ordinals, delete only ordinals `>= units`
//! 5. Propagate labels, annotations, env, resources and claim sizes to Units
//! 6. Record observed nodes in the node-pinning map
//! 7. Roll stale Units in readiness-gated batches
//! 8. Status, written only when it changed
//!
//! Deletion is finalizer-gated: Units go first, then the config ConfigMaps.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{ConfigMap, PodTemplate, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kunit_common::crd::{parse_node_map, Unit, UnitSet};
use kunit_common::deletion::{tear_down, DeletionWait, DependentSet};
use kunit_common::events::{EventPublisher, KubeEventPublisher, KunitEvent};
use kunit_common::fanout::FanOut;
use kunit_common::kube_utils::{
    build_api_resource, has_finalizer, ignore_already_exists, ignore_not_found, is_deleting,
    ok_if_not_found, poll_until, with_finalizer, without_finalizer,
};
use kunit_common::retry::{retry_on_conflict, RetryConfig};
use kunit_common::{
    annotation_enabled, naming, Error, OperatorConfig, ANNOTATION_EXTERNAL_NODEPORTS,
    ANNOTATION_FORCE_DELETE, ANNOTATION_LAST_APPLIED, ANNOTATION_MAINTENANCE,
    ANNOTATION_MAIN_CONTAINER_VERSION, ANNOTATION_NODE_NAME_MAP, ANNOTATION_TEMPLATE_HASH,
    ANNOTATION_UNIT_NODEPORTS, FINALIZER_CONFIG_CLEANUP, FINALIZER_UNIT_CLEANUP,
    LABEL_UNITSET_NAME,
};

use crate::artifacts::{
    pod_monitor, role, role_binding, service_account, to_dynamic, unit_certificate, unit_issuer,
};
use crate::config::{config_version, plan_template, refreshed_value, versioned_copy, ConfigAction};
use crate::rollout::{plan_batches, unit_ordinal};
use crate::services::{
    allocated_node_ports, external_reservations, external_service, headless_service,
    requests_node_ports, unit_reservations, unit_service, NodePortMap,
};
use crate::status::build_status;
use crate::template::{
    apply_fleet_shape, fleet_template_hash, merge_template, owned_metadata, render_pod_template,
    render_unit, template_hash,
};

/// Name reported on events
pub const CONTROLLER_NAME: &str = "kunit-unitset-controller";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed by the UnitSet controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnitSetKube: Send + Sync {
    /// Get a UnitSet
    async fn get_unitset(&self, name: &str, namespace: &str) -> Result<Option<UnitSet>, Error>;

    /// JSON merge patch a UnitSet (metadata only)
    async fn patch_unitset(&self, name: &str, namespace: &str, patch: &Value)
        -> Result<(), Error>;

    /// JSON merge patch a UnitSet's status
    async fn patch_unitset_status(
        &self,
        name: &str,
        namespace: &str,
        status: &Value,
    ) -> Result<(), Error>;

    /// Units labelled as members of `unitset`
    async fn list_units(&self, unitset: &str, namespace: &str) -> Result<Vec<Unit>, Error>;

    /// Get a Unit
    async fn get_unit(&self, name: &str, namespace: &str) -> Result<Option<Unit>, Error>;

    /// Create a Unit; an existing one is left alone
    async fn create_unit(&self, namespace: &str, unit: &Unit) -> Result<(), Error>;

    /// Replace a Unit (optimistic concurrency on its resourceVersion)
    async fn replace_unit(&self, name: &str, namespace: &str, unit: &Unit)
        -> Result<Unit, Error>;

    /// JSON merge patch a Unit
    async fn patch_unit(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error>;

    /// Delete a Unit; absent Units are not an error
    async fn delete_unit(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap; an existing one is left alone
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;

    /// Replace a ConfigMap
    async fn replace_config_map(
        &self,
        name: &str,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<(), Error>;

    /// Delete a ConfigMap; absent ones are not an error
    async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a PodTemplate
    async fn get_pod_template(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PodTemplate>, Error>;

    /// Create a PodTemplate
    async fn create_pod_template(&self, namespace: &str, template: &PodTemplate)
        -> Result<(), Error>;

    /// Replace a PodTemplate
    async fn replace_pod_template(
        &self,
        name: &str,
        namespace: &str,
        template: &PodTemplate,
    ) -> Result<(), Error>;

    /// Get a Service
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a Service, returning it with server-allocated fields
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Create a ServiceAccount if absent
    async fn ensure_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Create a Role if absent
    async fn ensure_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// Create a RoleBinding if absent
    async fn ensure_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Create a custom resource if absent.
    ///
    /// Returns `Ok(false)` when the API server does not serve its kind.
    async fn ensure_custom_object(&self, namespace: &str, obj: &DynamicObject)
        -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct UnitSetKubeImpl {
    client: Client,
}

impl UnitSetKubeImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UnitSetKube for UnitSetKubeImpl {
    async fn get_unitset(&self, name: &str, namespace: &str) -> Result<Option<UnitSet>, Error> {
        let api: Api<UnitSet> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn patch_unitset(
        &self,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        let api: Api<UnitSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_unitset_status(
        &self,
        name: &str,
        namespace: &str,
        status: &Value,
    ) -> Result<(), Error> {
        let api: Api<UnitSet> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn list_units(&self, unitset: &str, namespace: &str) -> Result<Vec<Unit>, Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", LABEL_UNITSET_NAME, unitset);
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn get_unit(&self, name: &str, namespace: &str) -> Result<Option<Unit>, Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_unit(&self, namespace: &str, unit: &Unit) -> Result<(), Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), unit).await)
    }

    async fn replace_unit(
        &self,
        name: &str,
        namespace: &str,
        unit: &Unit,
    ) -> Result<Unit, Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), unit).await?)
    }

    async fn patch_unit(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_unit(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Option<u32>,
    ) -> Result<(), Error> {
        let api: Api<Unit> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: grace_period,
            ..DeleteParams::default()
        };
        ignore_not_found(api.delete(name, &params).await)
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), cm).await)
    }

    async fn replace_config_map(
        &self,
        name: &str,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), cm).await?;
        Ok(())
    }

    async fn delete_config_map(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_pod_template(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PodTemplate>, Error> {
        let api: Api<PodTemplate> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_pod_template(
        &self,
        namespace: &str,
        template: &PodTemplate,
    ) -> Result<(), Error> {
        let api: Api<PodTemplate> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), template).await)
    }

    async fn replace_pod_template(
        &self,
        name: &str,
        namespace: &str,
        template: &PodTemplate,
    ) -> Result<(), Error> {
        let api: Api<PodTemplate> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), template).await?;
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ok_if_not_found(api.get(name).await)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn ensure_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), account).await)
    }

    async fn ensure_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), role).await)
    }

    async fn ensure_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), binding).await)
    }

    async fn ensure_custom_object(
        &self,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<bool, Error> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::serialization("custom object without apiVersion/kind"))?;
        let ar = build_api_resource(&types.api_version, &types.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state of the UnitSet controller
pub struct Context {
    /// Kubernetes operations
    pub kube: Arc<dyn UnitSetKube>,
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
        }
    }

    /// Context with mocks, test timings and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn UnitSetKube>) -> Self {
        Self {
            kube,
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

    async fn publish(&self, us: &UnitSet, event: KunitEvent) {
        self.events.record(&us.object_ref(&()), &event).await;
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
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

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(UnitSetKubeImpl::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            config: self.config,
            cancel: self.cancel,
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a UnitSet
#[instrument(skip(us, ctx), fields(unitset = %us.name_any()))]
pub async fn reconcile(us: Arc<UnitSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = us.name_any();
    let namespace = us
        .namespace()
        .ok_or_else(|| Error::validation(&name, "UnitSet is missing a namespace"))?;

    if is_deleting(us.as_ref()) {
        return finalize(&us, &name, &namespace, &ctx).await;
    }

    us.spec.validate(&name)?;

    if annotation_enabled(us.annotations(), ANNOTATION_MAINTENANCE) {
        info!("unitset in maintenance, skipping convergence");
        return Ok(Action::requeue(ctx.config.requeue_interval));
    }

    debug!(version = %us.spec.version, units = us.spec.units, "reconciling unitset");
    ensure_finalizers(&us, &name, &namespace, &ctx).await?;
    ensure_rbac(&us, &namespace, &ctx).await?;
    let fleet = ensure_fleet_template(&us, &name, &namespace, &ctx).await?;
    ensure_config(&us, &name, &namespace, &ctx).await?;
    ensure_services(&us, &name, &namespace, &fleet, &ctx).await?;
    ensure_certificates(&us, &name, &namespace, &ctx).await?;
    ensure_pod_monitor(&us, &namespace, &ctx).await?;

    let mut units = ctx.kube.list_units(&name, &namespace).await?;
    if scale(&us, &name, &namespace, &fleet, &units, &ctx).await? {
        units = ctx.kube.list_units(&name, &namespace).await?;
    }
    propagate_shape(&us, &namespace, &units, &ctx).await?;
    record_node_pins(&us, &name, &namespace, &units, &ctx).await?;
    let rolled = roll_out(&us, &name, &namespace, &fleet, &units, &ctx).await?;

    let units = ctx.kube.list_units(&name, &namespace).await?;
    write_status(&us, &units, &fleet, rolled, &name, &namespace, &ctx).await?;

    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Error policy for the UnitSet controller.
///
/// Validation errors wait for a spec change; everything else requeues on the
/// fixed error interval. A warning event is published either way.
pub fn error_policy(us: Arc<UnitSet>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        unitset = %us.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    let validation = matches!(error, Error::Validation { .. });
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let events = ctx.events.clone();
        let reference = us.object_ref(&());
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
    us: &UnitSet,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if has_finalizer(us, FINALIZER_UNIT_CLEANUP) && has_finalizer(us, FINALIZER_CONFIG_CLEANUP) {
        return Ok(());
    }

    retry_on_conflict(&ctx.retry(), "add unitset finalizers", move || async move {
        let Some(current) = ctx.kube.get_unitset(name, namespace).await? else {
            return Ok(());
        };
        let mut finalizers = current.finalizers().to_vec();
        let mut changed = false;
        for finalizer in [FINALIZER_UNIT_CLEANUP, FINALIZER_CONFIG_CLEANUP] {
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
        ctx.kube.patch_unitset(name, namespace, &patch).await?;
        debug!("added unitset finalizers");
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
    retry_on_conflict(&ctx.retry(), "remove unitset finalizer", move || async move {
        let Some(current) = ctx.kube.get_unitset(name, namespace).await? else {
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
        ctx.kube.patch_unitset(name, namespace, &patch).await
    })
    .await
}

/// Set or clear (`None`) one annotation on the UnitSet
async fn set_annotation(
    name: &str,
    namespace: &str,
    key: &str,
    value: Option<String>,
    ctx: &Context,
) -> Result<(), Error> {
    let patch = json!({ "metadata": { "annotations": { (key): value } } });
    ctx.kube.patch_unitset(name, namespace, &patch).await
}

async fn ensure_rbac(us: &UnitSet, namespace: &str, ctx: &Context) -> Result<(), Error> {
    let account = service_account(us);
    let role = role(us);
    let binding = role_binding(us);
    futures::try_join!(
        ctx.kube.ensure_service_account(namespace, &account),
        ctx.kube.ensure_role(namespace, &role),
        ctx.kube.ensure_role_binding(namespace, &binding),
    )?;
    Ok(())
}

// =============================================================================
// Pod template and config provisioning
// =============================================================================

/// Fleet copy of the golden pod template, stamped with the declared version
/// and the hash of its content
fn fleet_pod_template(us: &UnitSet, golden: &PodTemplate) -> Result<PodTemplate, Error> {
    let mut metadata = owned_metadata(us, &naming::unitset_pod_template(&us.name_any()));
    let mut annotations = golden.metadata.annotations.clone().unwrap_or_default();
    annotations.remove(ANNOTATION_LAST_APPLIED);
    annotations.insert(
        ANNOTATION_MAIN_CONTAINER_VERSION.to_string(),
        us.spec.version.clone(),
    );
    annotations.insert(
        ANNOTATION_TEMPLATE_HASH.to_string(),
        template_hash(&golden.template.clone().unwrap_or_default())?,
    );
    metadata.annotations = Some(annotations);
    Ok(PodTemplate {
        metadata,
        template: golden.template.clone(),
    })
}

async fn ensure_fleet_template(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<PodTemplate, Error> {
    let manager_ns = ctx.config.manager_namespace.as_str();
    let golden_name = us.spec.global_pod_template();
    let golden = ctx
        .kube
        .get_pod_template(&golden_name, manager_ns)
        .await?
        .ok_or_else(|| {
            Error::precondition(
                name,
                format!("pod template {}/{} not found", manager_ns, golden_name),
            )
        })?;

    let fleet_name = naming::unitset_pod_template(name);
    let mut desired = fleet_pod_template(us, &golden)?;
    match ctx.kube.get_pod_template(&fleet_name, namespace).await? {
        None => {
            ctx.kube.create_pod_template(namespace, &desired).await?;
            info!(template = %fleet_name, version = %us.spec.version, "created fleet pod template");
        }
        Some(live)
            if live.template == desired.template
                && live.annotations().get(ANNOTATION_MAIN_CONTAINER_VERSION)
                    == Some(&us.spec.version)
                && fleet_template_hash(&live) == fleet_template_hash(&desired) =>
        {
            return Ok(live);
        }
        Some(live) => {
            desired.metadata.resource_version = live.metadata.resource_version.clone();
            ctx.kube
                .replace_pod_template(&fleet_name, namespace, &desired)
                .await?;
            info!(template = %fleet_name, version = %us.spec.version, "refreshed fleet pod template");
        }
    }
    Ok(desired)
}

async fn apply_config(
    namespace: &str,
    action: ConfigAction,
    ctx: &Context,
) -> Result<(), Error> {
    match action {
        ConfigAction::Keep => Ok(()),
        ConfigAction::Create(cm) => {
            ctx.kube.create_config_map(namespace, &cm).await?;
            debug!(config = %cm.name_any(), "created config");
            Ok(())
        }
        ConfigAction::Replace(cm) => {
            let config = cm.name_any();
            ctx.kube.replace_config_map(&config, namespace, &cm).await?;
            info!(config = %config, version = ?config_version(&cm), "refreshed config");
            Ok(())
        }
    }
}

async fn ensure_unit_value(
    us: &UnitSet,
    unit: String,
    namespace: &str,
    new_global: &ConfigMap,
    ctx: &Context,
) -> Result<(), Error> {
    let value_name = naming::unit_config_value(&unit);
    let version = us.spec.version.as_str();
    let action = match ctx.kube.get_config_map(&value_name, namespace).await? {
        None => ConfigAction::Create(versioned_copy(us, &value_name, version, new_global)),
        Some(cm) if config_version(&cm) == Some(version) => ConfigAction::Keep,
        Some(cm) => {
            let previous = match config_version(&cm) {
                Some(old) => {
                    ctx.kube
                        .get_config_map(
                            &us.spec.global_config_value(old),
                            &ctx.config.manager_namespace,
                        )
                        .await?
                }
                None => None,
            };
            ConfigAction::Replace(refreshed_value(us, &cm, previous.as_ref(), new_global))
        }
    };
    apply_config(namespace, action, ctx).await
}

async fn ensure_config(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let manager_ns = ctx.config.manager_namespace.as_str();
    let version = us.spec.version.as_str();
    let source = |source_name: String| async move {
        ctx.kube
            .get_config_map(&source_name, manager_ns)
            .await?
            .ok_or_else(|| {
                Error::precondition(
                    name,
                    format!("config source {}/{} not found", manager_ns, source_name),
                )
            })
    };
    let (template_source, value_source) = futures::try_join!(
        source(us.spec.global_config_template(version)),
        source(us.spec.global_config_value(version)),
    )?;

    let template_name = naming::unitset_config_template(name);
    let existing = ctx.kube.get_config_map(&template_name, namespace).await?;
    let action = plan_template(us, &template_name, existing.as_ref(), &template_source);
    apply_config(namespace, action, ctx).await?;

    let mut tasks = FanOut::new(format!("config values of {}", name));
    for unit in us.expected_unit_names() {
        tasks.push(
            unit.clone(),
            ensure_unit_value(us, unit, namespace, &value_source, ctx),
        );
    }
    tasks.run().await
}

// =============================================================================
// Services and shared artifacts
// =============================================================================

/// Outcome of ensuring a service that may carry NodePort reservations
enum Reservation {
    Unchanged,
    Allocated(NodePortMap),
    Rejected(Error),
}

/// Live service, creating it when absent
async fn ensure_service(namespace: &str, service: &Service, ctx: &Context) -> Result<Service, Error> {
    let service_name = service.name_any();
    if let Some(live) = ctx.kube.get_service(&service_name, namespace).await? {
        return Ok(live);
    }
    let created = ctx.kube.create_service(namespace, service).await?;
    info!(service = %service_name, "created service");
    Ok(created)
}

async fn ensure_reserved_service(
    namespace: &str,
    service: &Service,
    reserved: &NodePortMap,
    ctx: &Context,
) -> Result<Reservation, Error> {
    match ensure_service(namespace, service, ctx).await {
        Ok(live) => {
            let allocated = allocated_node_ports(&live);
            if allocated.is_empty() || &allocated == reserved {
                Ok(Reservation::Unchanged)
            } else {
                Ok(Reservation::Allocated(allocated))
            }
        }
        Err(e) if requests_node_ports(service) => Ok(Reservation::Rejected(e)),
        Err(e) => Err(e),
    }
}

fn rejected(service: &str, source: Error) -> Error {
    Error::internal_with_context(
        "node port reservation",
        format!("service {} rejected its reserved node ports: {}", service, source),
    )
}

async fn ensure_services(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    fleet: &PodTemplate,
    ctx: &Context,
) -> Result<(), Error> {
    ensure_service(namespace, &headless_service(us, fleet), ctx).await?;

    let reserved = external_reservations(us.annotations());
    if let Some(service) = external_service(us, fleet, &reserved) {
        match ensure_reserved_service(namespace, &service, &reserved, ctx).await? {
            Reservation::Unchanged => {}
            Reservation::Allocated(allocated) => {
                let raw = serde_json::to_string(&allocated)?;
                set_annotation(name, namespace, ANNOTATION_EXTERNAL_NODEPORTS, Some(raw), ctx)
                    .await?;
            }
            Reservation::Rejected(e) => {
                warn!(error = %e, "external service rejected reserved node ports, releasing them");
                set_annotation(name, namespace, ANNOTATION_EXTERNAL_NODEPORTS, None, ctx).await?;
                return Err(rejected(&service.name_any(), e));
            }
        }
    }

    if us.spec.unit_service.service_type().is_none() {
        return Ok(());
    }
    let mut reservations = unit_reservations(us.annotations());
    let outcomes = join_all(us.expected_unit_names().into_iter().map(|unit| {
        let reserved = reservations.get(&unit).cloned().unwrap_or_default();
        async move {
            let outcome = match unit_service(us, &unit, fleet, &reserved) {
                Some(service) => ensure_reserved_service(namespace, &service, &reserved, ctx).await,
                None => Ok(Reservation::Unchanged),
            };
            (unit, outcome)
        }
    }))
    .await;

    let mut changed = false;
    let mut errors = Vec::new();
    for (unit, outcome) in outcomes {
        match outcome {
            Ok(Reservation::Unchanged) => {}
            Ok(Reservation::Allocated(allocated)) => {
                reservations.insert(unit, allocated);
                changed = true;
            }
            Ok(Reservation::Rejected(e)) => {
                warn!(unit = %unit, error = %e, "unit service rejected reserved node ports, releasing them");
                changed |= reservations.remove(&unit).is_some();
                errors.push(rejected(&naming::unit_service(&unit), e));
            }
            Err(e) => errors.push(e),
        }
    }
    if changed {
        let raw = serde_json::to_string(&reservations)?;
        set_annotation(name, namespace, ANNOTATION_UNIT_NODEPORTS, Some(raw), ctx).await?;
    }
    Error::aggregate(format!("unit services of {}", name), errors)
}

async fn ensure_unit_certificate(
    us: &UnitSet,
    unit: String,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let Some(profile) = us.spec.certificate.as_ref() else {
        return Ok(());
    };
    let issuer = to_dynamic(&unit_issuer(us, &unit, profile))?;
    if !ctx.kube.ensure_custom_object(namespace, &issuer).await? {
        return Err(Error::precondition(
            &unit,
            "cert-manager is not installed (Issuer kind not served)",
        ));
    }
    let certificate = to_dynamic(&unit_certificate(us, &unit, profile))?;
    ctx.kube.ensure_custom_object(namespace, &certificate).await?;
    Ok(())
}

async fn ensure_certificates(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    if us.spec.certificate.is_none() {
        return Ok(());
    }
    let mut tasks = FanOut::new(format!("certificates of {}", name));
    for unit in us.expected_unit_names() {
        tasks.push(unit.clone(), ensure_unit_certificate(us, unit, namespace, ctx));
    }
    tasks.run().await
}

async fn ensure_pod_monitor(us: &UnitSet, namespace: &str, ctx: &Context) -> Result<(), Error> {
    let Some(monitor) = pod_monitor(us) else {
        return Ok(());
    };
    if !ctx
        .kube
        .ensure_custom_object(namespace, &to_dynamic(&monitor)?)
        .await?
    {
        warn!("PodMonitor kind is not served, skipping scrape configuration");
    }
    Ok(())
}

// =============================================================================
// Units
// =============================================================================

async fn create_unit(unit: Unit, namespace: &str, ctx: &Context) -> Result<(), Error> {
    ctx.kube.create_unit(namespace, &unit).await?;
    info!(unit = %unit.name_any(), "created unit");
    Ok(())
}

async fn remove_unit(unit: String, namespace: &str, ctx: &Context) -> Result<(), Error> {
    ctx.kube.delete_unit(&unit, namespace, None).await?;
    ctx.kube
        .delete_config_map(&naming::unit_config_value(&unit), namespace)
        .await?;
    info!(unit = %unit, "deleted excess unit");
    Ok(())
}

/// Create missing ordinals and delete ordinals `>= units`.
///
/// Returns true when anything was issued.
async fn scale(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    fleet: &PodTemplate,
    units: &[Unit],
    ctx: &Context,
) -> Result<bool, Error> {
    let existing: BTreeSet<String> = units.iter().map(|u| u.name_any()).collect();
    let node_map = parse_node_map(us.annotations());
    let mut tasks = FanOut::new(format!("scaling of {}", name));
    let (mut created, mut deleted) = (0, 0);

    for ordinal in 0..us.spec.units {
        if existing.contains(&naming::unit_name(name, ordinal)) {
            continue;
        }
        let unit = render_unit(us, ordinal, fleet, &node_map);
        tasks.push(unit.name_any(), create_unit(unit, namespace, ctx));
        created += 1;
    }

    for unit in units {
        let excess = unit_ordinal(unit).is_some_and(|ordinal| ordinal >= us.spec.units);
        if excess && !is_deleting(unit) {
            tasks.push(unit.name_any(), remove_unit(unit.name_any(), namespace, ctx));
            deleted += 1;
        }
    }

    if created == 0 && deleted == 0 {
        return Ok(false);
    }
    info!(created, deleted, units = us.spec.units, "scaling unitset");
    let result = tasks.run().await;
    ctx.publish(us, KunitEvent::Scaled { created, deleted }).await;
    result.map(|_| true)
}

async fn update_unit_shape(
    us: &UnitSet,
    unit: String,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let unit = unit.as_str();
    retry_on_conflict(&ctx.retry(), "propagate fleet shape", move || async move {
        let Some(mut current) = ctx.kube.get_unit(unit, namespace).await? else {
            return Ok(());
        };
        if !apply_fleet_shape(us, &mut current) {
            return Ok(());
        }
        ctx.kube.replace_unit(unit, namespace, &current).await?;
        debug!(unit, "propagated fleet shape");
        Ok(())
    })
    .await
}

/// Labels, annotations, env, resources and claim sizes; no readiness gate
async fn propagate_shape(
    us: &UnitSet,
    namespace: &str,
    units: &[Unit],
    ctx: &Context,
) -> Result<(), Error> {
    let mut tasks = FanOut::new("fleet shape propagation");
    for unit in units.iter().filter(|u| !is_deleting(*u)) {
        let mut shaped = unit.clone();
        if apply_fleet_shape(us, &mut shaped) {
            tasks.push(unit.name_any(), update_unit_shape(us, unit.name_any(), namespace, ctx));
        }
    }
    tasks.run().await
}

/// Fill missing node-map entries with the nodes units were observed on
async fn record_node_pins(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    units: &[Unit],
    ctx: &Context,
) -> Result<(), Error> {
    let mut node_map = parse_node_map(us.annotations());
    let mut added = 0;
    for unit in units {
        let Some(node) = unit.status.as_ref().and_then(|s| s.node_name.clone()) else {
            continue;
        };
        let unit_name = unit.name_any();
        if !node_map.contains_key(&unit_name) {
            node_map.insert(unit_name, Some(node));
            added += 1;
        }
    }
    if added == 0 {
        return Ok(());
    }
    let raw = serde_json::to_string(&node_map)?;
    set_annotation(name, namespace, ANNOTATION_NODE_NAME_MAP, Some(raw), ctx).await?;
    debug!(added, "recorded unit nodes");
    Ok(())
}

// =============================================================================
// Rolling update
// =============================================================================

async fn wait_for_ready(
    unit: &str,
    namespace: &str,
    generation: Option<i64>,
    ctx: &Context,
) -> Result<(), Error> {
    poll_until(
        ctx.config.ready_timeout,
        ctx.config.poll_interval,
        &ctx.cancel,
        format!("unit {} to become ready", unit),
        move || async move {
            let Some(current) = ctx.kube.get_unit(unit, namespace).await? else {
                return Ok(false);
            };
            let caught_up = match (generation, current.metadata.generation) {
                (Some(wanted), Some(seen)) => seen >= wanted,
                _ => true,
            };
            Ok(caught_up && current.is_ready_for_generation())
        },
    )
    .await
}

/// Merge the fleet template into one unit, wait for it, then stamp its version
/// and the fleet template hash
async fn roll_unit(
    us: &UnitSet,
    unit: &str,
    namespace: &str,
    fleet: &PodTemplate,
    ctx: &Context,
) -> Result<(), Error> {
    let generation = retry_on_conflict(&ctx.retry(), "roll unit template", move || async move {
        let current = ctx.kube.get_unit(unit, namespace).await?.ok_or_else(|| {
            Error::internal_with_context("rolling update", format!("unit {} disappeared", unit))
        })?;
        let incoming = render_pod_template(us, unit, fleet);
        let merged = merge_template(&current.spec.template, &incoming);
        if merged == current.spec.template {
            return Ok(current.metadata.generation);
        }
        let mut updated = current;
        updated.spec.template = merged;
        let replaced = ctx.kube.replace_unit(unit, namespace, &updated).await?;
        info!(unit, version = %us.spec.version, "replaced unit template");
        Ok(replaced.metadata.generation)
    })
    .await?;

    wait_for_ready(unit, namespace, generation, ctx).await?;

    let patch = json!({
        "metadata": {
            "annotations": {
                (ANNOTATION_MAIN_CONTAINER_VERSION): us.spec.version,
                (ANNOTATION_TEMPLATE_HASH): fleet_template_hash(fleet),
            }
        }
    });
    ctx.kube.patch_unit(unit, namespace, &patch).await?;
    info!(unit, version = %us.spec.version, "unit rolled");
    Ok(())
}

async fn set_in_update(
    name: &str,
    namespace: &str,
    in_update: &str,
    ctx: &Context,
) -> Result<(), Error> {
    retry_on_conflict(&ctx.retry(), "mark unit in update", move || async move {
        ctx.kube
            .patch_unitset_status(name, namespace, &json!({ "inUpdate": in_update }))
            .await
    })
    .await
}

/// Roll stale units batch by batch; a failed batch stops the rollout.
///
/// Returns true when at least one batch ran.
async fn roll_out(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    fleet: &PodTemplate,
    units: &[Unit],
    ctx: &Context,
) -> Result<bool, Error> {
    let batches = plan_batches(us, units, fleet_template_hash(fleet));
    if batches.is_empty() {
        return Ok(false);
    }
    info!(batches = batches.len(), version = %us.spec.version, "starting rolling update");

    for batch in &batches {
        let in_update = batch.join(",");
        set_in_update(name, namespace, &in_update, ctx).await?;

        let mut tasks = FanOut::new(format!("rolling update of {}", name));
        for unit in batch {
            tasks.push(unit.clone(), roll_unit(us, unit, namespace, fleet, ctx));
        }
        tasks.run().await?;

        ctx.publish(
            us,
            KunitEvent::UnitsUpdated {
                units: in_update,
                version: us.spec.version.clone(),
            },
        )
        .await;
    }
    Ok(true)
}

async fn write_status(
    us: &UnitSet,
    units: &[Unit],
    fleet: &PodTemplate,
    rolled: bool,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let status = build_status(us, units, fleet_template_hash(fleet), "");
    // A rollout wrote inUpdate after `us` was read
    if !rolled && us.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let value = serde_json::to_value(&status)?;
    let value = &value;
    retry_on_conflict(&ctx.retry(), "patch unitset status", move || async move {
        ctx.kube.patch_unitset_status(name, namespace, value).await
    })
    .await?;
    debug!(
        units = status.units,
        ready = status.ready_units,
        "updated unitset status"
    );
    Ok(())
}

// =============================================================================
// Deletion
// =============================================================================

struct UnitDependents<'a> {
    kube: &'a dyn UnitSetKube,
    unitset: &'a str,
    namespace: &'a str,
}

impl UnitDependents<'_> {
    async fn delete_unit(&self, unit: &Unit, force: bool) -> Result<(), Error> {
        let unit_name = unit.name_any();
        if force && !annotation_enabled(unit.annotations(), ANNOTATION_FORCE_DELETE) {
            let patch = json!({
                "metadata": { "annotations": { (ANNOTATION_FORCE_DELETE): "true" } }
            });
            self.kube.patch_unit(&unit_name, self.namespace, &patch).await?;
        }
        self.kube
            .delete_unit(&unit_name, self.namespace, force.then_some(0))
            .await
    }
}

#[async_trait]
impl DependentSet for UnitDependents<'_> {
    fn finalizer(&self) -> &'static str {
        FINALIZER_UNIT_CLEANUP
    }

    async fn delete_all(&self, force: bool) -> Result<(), Error> {
        let units = self.kube.list_units(self.unitset, self.namespace).await?;
        let mut tasks = FanOut::new("unit deletion");
        for unit in &units {
            tasks.push(unit.name_any(), self.delete_unit(unit, force));
        }
        tasks.run().await
    }

    async fn remaining(&self) -> Result<usize, Error> {
        Ok(self.kube.list_units(self.unitset, self.namespace).await?.len())
    }
}

struct ConfigDependents<'a> {
    kube: &'a dyn UnitSetKube,
    namespace: &'a str,
    names: Vec<String>,
}

#[async_trait]
impl DependentSet for ConfigDependents<'_> {
    fn finalizer(&self) -> &'static str {
        FINALIZER_CONFIG_CLEANUP
    }

    async fn delete_all(&self, _force: bool) -> Result<(), Error> {
        let mut tasks = FanOut::new("config deletion");
        for config in &self.names {
            tasks.push(
                config.clone(),
                self.kube.delete_config_map(config, self.namespace),
            );
        }
        tasks.run().await
    }

    async fn remaining(&self) -> Result<usize, Error> {
        let present = futures::future::try_join_all(
            self.names
                .iter()
                .map(|config| self.kube.get_config_map(config, self.namespace)),
        )
        .await?;
        Ok(present.into_iter().flatten().count())
    }
}

async fn finalize(
    us: &UnitSet,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let force = annotation_enabled(us.annotations(), ANNOTATION_FORCE_DELETE);
    let wait = ctx.deletion_wait();
    info!(force, "unitset deleting, tearing down dependents");

    if has_finalizer(us, FINALIZER_UNIT_CLEANUP) {
        let units = UnitDependents {
            kube: ctx.kube.as_ref(),
            unitset: name,
            namespace,
        };
        tear_down(name, &units, force, &wait, &ctx.cancel).await?;
        remove_finalizer(name, namespace, FINALIZER_UNIT_CLEANUP, ctx).await?;
    }

    if has_finalizer(us, FINALIZER_CONFIG_CLEANUP) {
        let mut names = vec![naming::unitset_config_template(name)];
        names.extend(
            us.expected_unit_names()
                .iter()
                .map(|unit| naming::unit_config_value(unit)),
        );
        let configs = ConfigDependents {
            kube: ctx.kube.as_ref(),
            namespace,
            names,
        };
        tear_down(name, &configs, force, &wait, &ctx.cancel).await?;
        remove_finalizer(name, namespace, FINALIZER_CONFIG_CLEANUP, ctx).await?;
    }

    ctx.publish(
        us,
        KunitEvent::CleanupComplete {
            dependents: "units and config",
            owner: name.to_string(),
        },
    )
    .await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use kunit_common::crd::{ServiceExposure, UnitPhase, UnitSetSpec, UnitStatus};
    use kunit_common::{
        ANNOTATION_CONFIG_VERSION, ANNOTATION_MAIN_CONTAINER, ANNOTATION_NODE_UNPINNED,
        LABEL_UNIT_ORDINAL,
    };
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const NS: &str = "db";
    const MANAGER_NS: &str = kunit_common::DEFAULT_MANAGER_NAMESPACE;

    // =========================================================================
    // In-memory cluster behind the mock
    // =========================================================================

    #[derive(Default)]
    struct World {
        unitset: Option<UnitSet>,
        units: BTreeMap<String, Unit>,
        config_maps: BTreeMap<(String, String), ConfigMap>,
        pod_templates: BTreeMap<(String, String), PodTemplate>,
        services: BTreeMap<String, Service>,
        custom_objects: Vec<String>,
        unitset_patches: Vec<Value>,
        status_patches: Vec<Value>,
        replaced: Vec<String>,
        log: Vec<String>,
        units_become_ready: bool,
        reject_node_ports: bool,
    }

    type Shared = Arc<Mutex<World>>;

    fn merge_json(target: &mut Value, patch: &Value) {
        match (target.as_object_mut(), patch.as_object()) {
            (Some(target), Some(patch)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
            _ => *target = patch.clone(),
        }
    }

    fn patched<T: Serialize + DeserializeOwned>(obj: &T, patch: &Value) -> T {
        let mut value = serde_json::to_value(obj).unwrap();
        merge_json(&mut value, patch);
        serde_json::from_value(value).unwrap()
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    fn mark_ready(unit: &mut Unit) {
        let status = unit.status.get_or_insert_with(UnitStatus::default);
        status.phase = UnitPhase::Ready;
        status.observed_generation = unit.metadata.generation;
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: "Invalid".to_string(),
            code,
        }))
    }

    fn mock_world(world: &Shared) -> MockUnitSetKube {
        let mut mock = MockUnitSetKube::new();

        let w = world.clone();
        mock.expect_get_unitset()
            .returning(move |_, _| Ok(w.lock().unwrap().unitset.clone()));
        let w = world.clone();
        mock.expect_patch_unitset().returning(move |_, _, patch| {
            let mut world = w.lock().unwrap();
            if let Some(finalizers) = patch["metadata"].get("finalizers") {
                world.log.push(format!("finalizers {}", finalizers));
            }
            world.unitset_patches.push(patch.clone());
            world.unitset = world.unitset.as_ref().map(|us| patched(us, patch));
            Ok(())
        });
        let w = world.clone();
        mock.expect_patch_unitset_status()
            .returning(move |_, _, status| {
                let mut world = w.lock().unwrap();
                world.status_patches.push(status.clone());
                let patch = json!({ "status": status });
                world.unitset = world.unitset.as_ref().map(|us| patched(us, &patch));
                Ok(())
            });

        let w = world.clone();
        mock.expect_list_units().returning(move |unitset, _| {
            Ok(w.lock()
                .unwrap()
                .units
                .values()
                .filter(|u| u.labels().get(LABEL_UNITSET_NAME).map(String::as_str) == Some(unitset))
                .cloned()
                .collect())
        });
        let w = world.clone();
        mock.expect_get_unit()
            .returning(move |name, _| Ok(w.lock().unwrap().units.get(name).cloned()));
        let w = world.clone();
        mock.expect_create_unit().returning(move |_, unit| {
            let mut world = w.lock().unwrap();
            let mut unit = unit.clone();
            unit.metadata.generation = Some(1);
            if world.units_become_ready {
                mark_ready(&mut unit);
            }
            world.log.push(format!("create unit {}", unit.name_any()));
            world.units.insert(unit.name_any(), unit);
            Ok(())
        });
        let w = world.clone();
        mock.expect_replace_unit().returning(move |name, _, unit| {
            let mut world = w.lock().unwrap();
            let previous = world.units.get(name).cloned().unwrap();
            let mut unit = unit.clone();
            let generation = previous.metadata.generation.unwrap_or(1);
            unit.metadata.generation = if unit.spec != previous.spec {
                Some(generation + 1)
            } else {
                Some(generation)
            };
            unit.status = previous.status.clone();
            if world.units_become_ready {
                mark_ready(&mut unit);
            }
            world.replaced.push(name.to_string());
            world.units.insert(name.to_string(), unit.clone());
            Ok(unit)
        });
        let w = world.clone();
        mock.expect_patch_unit().returning(move |name, _, patch| {
            let mut world = w.lock().unwrap();
            world.log.push(format!("patch unit {}", name));
            if let Some(unit) = world.units.get(name).cloned() {
                world.units.insert(name.to_string(), patched(&unit, patch));
            }
            Ok(())
        });
        let w = world.clone();
        mock.expect_delete_unit().returning(move |name, _, grace| {
            let mut world = w.lock().unwrap();
            world.log.push(format!("delete unit {} grace={:?}", name, grace));
            world.units.remove(name);
            Ok(())
        });

        let w = world.clone();
        mock.expect_get_config_map().returning(move |name, ns| {
            Ok(w.lock().unwrap().config_maps.get(&key(ns, name)).cloned())
        });
        let w = world.clone();
        mock.expect_create_config_map().returning(move |ns, cm| {
            let mut world = w.lock().unwrap();
            world.config_maps.insert(key(ns, &cm.name_any()), cm.clone());
            Ok(())
        });
        let w = world.clone();
        mock.expect_replace_config_map().returning(move |name, ns, cm| {
            w.lock().unwrap().config_maps.insert(key(ns, name), cm.clone());
            Ok(())
        });
        let w = world.clone();
        mock.expect_delete_config_map().returning(move |name, ns| {
            let mut world = w.lock().unwrap();
            world.log.push(format!("delete config {}", name));
            world.config_maps.remove(&key(ns, name));
            Ok(())
        });

        let w = world.clone();
        mock.expect_get_pod_template().returning(move |name, ns| {
            Ok(w.lock().unwrap().pod_templates.get(&key(ns, name)).cloned())
        });
        let w = world.clone();
        mock.expect_create_pod_template().returning(move |ns, t| {
            w.lock().unwrap().pod_templates.insert(key(ns, &t.name_any()), t.clone());
            Ok(())
        });
        let w = world.clone();
        mock.expect_replace_pod_template().returning(move |name, ns, t| {
            w.lock().unwrap().pod_templates.insert(key(ns, name), t.clone());
            Ok(())
        });

        let w = world.clone();
        mock.expect_get_service()
            .returning(move |name, _| Ok(w.lock().unwrap().services.get(name).cloned()));
        let w = world.clone();
        mock.expect_create_service().returning(move |_, service| {
            let mut world = w.lock().unwrap();
            if world.reject_node_ports && requests_node_ports(service) {
                return Err(api_error(422));
            }
            let mut service = service.clone();
            let node_ports = service
                .spec
                .as_ref()
                .and_then(|s| s.type_.as_deref())
                .is_some_and(|t| t == "NodePort");
            if node_ports {
                for (i, port) in service
                    .spec
                    .as_mut()
                    .and_then(|s| s.ports.as_mut())
                    .into_iter()
                    .flatten()
                    .enumerate()
                {
                    port.node_port.get_or_insert(30000 + i as i32);
                }
            }
            world.log.push(format!("create service {}", service.name_any()));
            world.services.insert(service.name_any(), service.clone());
            Ok(service)
        });

        mock.expect_ensure_service_account().returning(|_, _| Ok(()));
        mock.expect_ensure_role().returning(|_, _| Ok(()));
        mock.expect_ensure_role_binding().returning(|_, _| Ok(()));
        let w = world.clone();
        mock.expect_ensure_custom_object().returning(move |_, obj| {
            let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
            w.lock()
                .unwrap()
                .custom_objects
                .push(format!("{}/{}", kind, obj.name_any()));
            Ok(true)
        });

        mock
    }

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_unitset(version: &str, units: u32) -> UnitSet {
        let mut us = UnitSet::new(
            "mysql",
            UnitSetSpec {
                type_: "mysql".to_string(),
                version: version.to_string(),
                units,
                ..Default::default()
            },
        );
        us.metadata.namespace = Some(NS.to_string());
        us.metadata.uid = Some("us-uid".to_string());
        us.metadata.generation = Some(1);
        us.metadata.finalizers = Some(vec![
            FINALIZER_UNIT_CLEANUP.to_string(),
            FINALIZER_CONFIG_CLEANUP.to_string(),
        ]);
        us
    }

    fn golden(version: &str) -> PodTemplate {
        PodTemplate {
            metadata: ObjectMeta {
                name: Some(format!("mysql-{}-pod-template", version)),
                namespace: Some(MANAGER_NS.to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_MAIN_CONTAINER.to_string(),
                    "mysql".to_string(),
                )])),
                ..Default::default()
            },
            template: Some(PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![
                        Container {
                            name: "mysql".to_string(),
                            image: Some(format!("mysql:{}", version)),
                            ports: Some(vec![ContainerPort {
                                name: Some("mysql".to_string()),
                                container_port: 3306,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        },
                        Container {
                            name: "unit-agent".to_string(),
                            image: Some("agent:1".to_string()),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }),
            }),
        }
    }

    fn config_map(name: &str, pairs: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn global_template(version: &str) -> ConfigMap {
        config_map(
            &format!("mysql-{}-config-template", version),
            &[("my.cnf", &format!("v{}", version))],
        )
    }

    fn global_value(version: &str) -> ConfigMap {
        match version {
            "8.0.40" => config_map("mysql-8.0.40-config-value", &[("max_connections", "100")]),
            _ => config_map(
                &format!("mysql-{}-config-value", version),
                &[("max_connections", "200"), ("gtid", "on")],
            ),
        }
    }

    /// Cluster with golden sources for 8.0.40 and 8.0.41 and `count` units
    /// converged on `deployed`
    fn seeded_world(deployed: &str, count: u32) -> World {
        let mut world = World::default();
        for version in ["8.0.40", "8.0.41"] {
            world
                .pod_templates
                .insert(key(MANAGER_NS, &golden(version).name_any()), golden(version));
            for cm in [global_template(version), global_value(version)] {
                world.config_maps.insert(key(MANAGER_NS, &cm.name_any()), cm);
            }
        }

        let old = sample_unitset(deployed, count);
        let fleet = fleet_pod_template(&old, &golden(deployed)).unwrap();
        world
            .pod_templates
            .insert(key(NS, "mysql-pod-template"), fleet.clone());
        let template = versioned_copy(&old, "mysql-config-template", deployed, &global_template(deployed));
        world.config_maps.insert(key(NS, "mysql-config-template"), template);

        for ordinal in 0..count {
            let mut unit = render_unit(&old, ordinal, &fleet, &BTreeMap::new());
            unit.metadata.generation = Some(1);
            mark_ready(&mut unit);
            unit.status.as_mut().unwrap().node_name = Some(format!("node-{}", ordinal));
            let value_name = naming::unit_config_value(&unit.name_any());
            let value = versioned_copy(&old, &value_name, deployed, &global_value(deployed));
            world.config_maps.insert(key(NS, &value_name), value);
            world.units.insert(unit.name_any(), unit);
        }
        world
    }

    fn shared(world: World, us: &UnitSet) -> Shared {
        let mut world = world;
        world.unitset = Some(us.clone());
        Arc::new(Mutex::new(world))
    }

    fn ctx(kube: MockUnitSetKube) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube)))
    }

    fn image_of(unit: &Unit) -> String {
        unit.spec.template.spec.as_ref().unwrap().containers[0]
            .image
            .clone()
            .unwrap()
    }

    fn version_of(unit: &Unit) -> Option<String> {
        unit.annotations().get(ANNOTATION_MAIN_CONTAINER_VERSION).cloned()
    }

    fn data_of<'a>(world: &'a World, name: &str) -> &'a BTreeMap<String, String> {
        world.config_maps[&key(NS, name)].data.as_ref().unwrap()
    }

    fn env_var(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn main_env(unit: &Unit) -> Vec<EnvVar> {
        unit.spec.template.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap_or_default()
    }

    // =========================================================================
    // Rolling Update Story Tests
    // =========================================================================

    /// Story: Three units on 8.0.40 roll to 8.0.41 one at a time, highest
    /// ordinal first, and the fleet reports image sync at the end
    #[tokio::test]
    async fn story_three_replica_rolling_update() {
        let us = sample_unitset("8.0.41", 3);
        let mut world = seeded_world("8.0.40", 3);
        world.units_become_ready = true;
        // mysql-1 carries a hand-tuned value
        world.config_maps.insert(
            key(NS, "mysql-1-config-value"),
            versioned_copy(
                &sample_unitset("8.0.40", 3),
                "mysql-1-config-value",
                "8.0.40",
                &config_map("x", &[("max_connections", "500")]),
            ),
        );
        let world = shared(world, &us);

        let action = reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .expect("rollout should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let world = world.lock().unwrap();
        assert_eq!(world.replaced, vec!["mysql-2", "mysql-1", "mysql-0"]);
        for unit in world.units.values() {
            assert_eq!(image_of(unit), "mysql:8.0.41");
            assert_eq!(version_of(unit).as_deref(), Some("8.0.41"));
        }

        let in_updates: Vec<&Value> = world
            .status_patches
            .iter()
            .filter(|p| p.get("imageSyncStatus").is_none())
            .map(|p| &p["inUpdate"])
            .collect();
        assert_eq!(in_updates, vec!["mysql-2", "mysql-1", "mysql-0"]);
        let last = world.status_patches.last().unwrap();
        assert_eq!(last["inUpdate"], "");
        assert_eq!(last["imageSyncStatus"]["status"], true);
        assert_eq!(last["readyUnits"], 3);

        let fleet = &world.pod_templates[&key(NS, "mysql-pod-template")];
        assert_eq!(
            fleet.annotations().get(ANNOTATION_MAIN_CONTAINER_VERSION).map(String::as_str),
            Some("8.0.41")
        );
        assert_eq!(data_of(&world, "mysql-config-template")["my.cnf"], "v8.0.41");
        assert_eq!(data_of(&world, "mysql-0-config-value")["max_connections"], "200");
        assert_eq!(data_of(&world, "mysql-1-config-value")["max_connections"], "500");
        assert_eq!(data_of(&world, "mysql-1-config-value")["gtid"], "on");
        let stamp = world.config_maps[&key(NS, "mysql-2-config-value")]
            .metadata
            .annotations
            .as_ref()
            .unwrap()[ANNOTATION_CONFIG_VERSION]
            .clone();
        assert_eq!(stamp, "8.0.41");
    }

    /// Story: A golden template edited in place at the same version rolls every
    /// unit, and image sync holds off until they carry the new content
    #[tokio::test]
    async fn story_same_version_template_edit_rolls_units() {
        let us = sample_unitset("8.0.40", 2);
        let mut world = seeded_world("8.0.40", 2);
        world.units_become_ready = true;
        let source = world
            .pod_templates
            .get_mut(&key(MANAGER_NS, "mysql-8.0.40-pod-template"))
            .unwrap();
        source.template.as_mut().unwrap().spec.as_mut().unwrap().containers[1].image =
            Some("agent:2".to_string());
        let world = shared(world, &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .expect("content rollout should succeed");

        let world = world.lock().unwrap();
        assert_eq!(world.replaced, vec!["mysql-1", "mysql-0"]);
        let fleet = &world.pod_templates[&key(NS, "mysql-pod-template")];
        let hash = fleet_template_hash(fleet).unwrap();
        for unit in world.units.values() {
            let agent = &unit.spec.template.spec.as_ref().unwrap().containers[1];
            assert_eq!(agent.image.as_deref(), Some("agent:2"));
            assert_eq!(version_of(unit).as_deref(), Some("8.0.40"));
            assert_eq!(unit.annotations()[ANNOTATION_TEMPLATE_HASH], hash);
        }
        let last = world.status_patches.last().unwrap();
        assert_eq!(last["inUpdate"], "");
        assert_eq!(last["imageSyncStatus"]["status"], true);
    }

    /// Story: Env from the new template replaces the unit's values for the same
    /// names during a rollout; names only the unit declares survive
    #[tokio::test]
    async fn story_rollout_env_comes_from_new_template() {
        let us = sample_unitset("8.0.41", 1);
        let mut world = seeded_world("8.0.40", 1);
        world.units_become_ready = true;
        world
            .pod_templates
            .get_mut(&key(MANAGER_NS, "mysql-8.0.41-pod-template"))
            .unwrap()
            .template
            .as_mut()
            .unwrap()
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .env = Some(vec![env_var("MYSQL_PORT", "3307")]);
        world
            .units
            .get_mut("mysql-0")
            .unwrap()
            .spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .env = Some(vec![env_var("MYSQL_PORT", "3306"), env_var("LOCAL_ONLY", "1")]);
        let world = shared(world, &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert_eq!(world.replaced, vec!["mysql-0"]);
        assert_eq!(
            main_env(&world.units["mysql-0"]),
            vec![env_var("MYSQL_PORT", "3307"), env_var("LOCAL_ONLY", "1")]
        );
    }

    /// Story: A unit that never becomes ready stops the rollout at that unit
    #[tokio::test]
    async fn story_rollout_stops_at_unready_unit() {
        let us = sample_unitset("8.0.41", 3);
        let world = shared(seeded_world("8.0.40", 3), &us);

        let err = reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let world = world.lock().unwrap();
        assert_eq!(world.replaced, vec!["mysql-2"]);
        assert_eq!(version_of(&world.units["mysql-2"]).as_deref(), Some("8.0.40"));
        assert_eq!(image_of(&world.units["mysql-1"]), "mysql:8.0.40");
        assert_eq!(world.status_patches, vec![json!({ "inUpdate": "mysql-2" })]);
    }

    /// Story: The partition shields low ordinals from the rollout
    #[tokio::test]
    async fn story_partition_limits_rollout() {
        let mut us = sample_unitset("8.0.41", 3);
        us.spec.update_strategy.rolling_update.partition = 2;
        let mut world = seeded_world("8.0.40", 3);
        world.units_become_ready = true;
        let world = shared(world, &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert_eq!(world.replaced, vec!["mysql-2"]);
        assert_eq!(image_of(&world.units["mysql-0"]), "mysql:8.0.40");
        let last = world.status_patches.last().unwrap();
        assert_eq!(last["imageSyncStatus"]["status"], false);
    }

    // =========================================================================
    // Scale Story Tests
    // =========================================================================

    /// Story: Scaling up creates the missing ordinals with their config
    #[tokio::test]
    async fn story_scale_up_creates_missing_units() {
        let us = sample_unitset("8.0.40", 3);
        let world = shared(seeded_world("8.0.40", 1), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert_eq!(
            world.units.keys().collect::<Vec<_>>(),
            vec!["mysql-0", "mysql-1", "mysql-2"]
        );
        let created = &world.units["mysql-2"];
        assert_eq!(created.labels()[LABEL_UNIT_ORDINAL], "2");
        assert_eq!(created.spec.config_value_name, "mysql-2-config-value");
        assert!(world
            .config_maps
            .contains_key(&key(NS, "mysql-2-config-value")));
        assert!(world.replaced.is_empty());
    }

    /// Story: Scaling down deletes only ordinals at or above the new count
    #[tokio::test]
    async fn story_scale_down_deletes_only_high_ordinals() {
        let us = sample_unitset("8.0.40", 1);
        let mut world = seeded_world("8.0.40", 3);
        // A member without an ordinal label is never considered excess
        let mut stray = world.units["mysql-2"].clone();
        stray.metadata.name = Some("mysql-9".to_string());
        stray.metadata.labels.as_mut().unwrap().remove(LABEL_UNIT_ORDINAL);
        world.units.insert("mysql-9".to_string(), stray);
        let world = shared(world, &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert_eq!(
            world.units.keys().collect::<Vec<_>>(),
            vec!["mysql-0", "mysql-9"]
        );
        assert!(!world.config_maps.contains_key(&key(NS, "mysql-1-config-value")));
        assert!(!world.config_maps.contains_key(&key(NS, "mysql-2-config-value")));
        assert!(world.config_maps.contains_key(&key(NS, "mysql-0-config-value")));
    }

    // =========================================================================
    // Convergence Story Tests
    // =========================================================================

    /// Story: A converged fleet makes no writes on the second pass
    #[tokio::test]
    async fn story_converged_fleet_is_idempotent() {
        let us = sample_unitset("8.0.40", 2);
        let world = shared(seeded_world("8.0.40", 2), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();
        let (us, writes) = {
            let world = world.lock().unwrap();
            assert_eq!(world.status_patches.len(), 1);
            let writes = world.log.len() + world.unitset_patches.len() + world.status_patches.len();
            (world.unitset.clone().unwrap(), writes)
        };

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();
        let world = world.lock().unwrap();
        let after = world.log.len() + world.unitset_patches.len() + world.status_patches.len();
        assert_eq!(after, writes);
        assert!(world.replaced.is_empty());
    }

    /// Story: Fleet resources reach the units without waiting for readiness
    #[tokio::test]
    async fn story_resources_propagate_without_gate() {
        use k8s_openapi::api::core::v1::ResourceRequirements;
        use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

        let mut us = sample_unitset("8.0.40", 2);
        let resources = ResourceRequirements {
            limits: Some(BTreeMap::from([("cpu".to_string(), Quantity("4".to_string()))])),
            ..Default::default()
        };
        us.spec.resources = Some(resources.clone());
        let world = shared(seeded_world("8.0.40", 2), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert_eq!(world.replaced.len(), 2);
        for unit in world.units.values() {
            let main = &unit.spec.template.spec.as_ref().unwrap().containers[0];
            assert_eq!(main.resources.as_ref(), Some(&resources));
        }
    }

    /// Story: A fleet env edit reaches every unit without a version change,
    /// keeping names only a unit declares
    #[tokio::test]
    async fn story_env_edit_propagates_to_units() {
        let mut us = sample_unitset("8.0.40", 2);
        us.spec.env = vec![env_var("ROLE", "replica")];
        let mut world = seeded_world("8.0.40", 2);
        world
            .units
            .get_mut("mysql-0")
            .unwrap()
            .spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .env = Some(vec![env_var("LOCAL_ONLY", "1")]);
        let world = shared(world, &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        let mut replaced = world.replaced.clone();
        replaced.sort();
        assert_eq!(replaced, vec!["mysql-0", "mysql-1"]);
        assert_eq!(
            main_env(&world.units["mysql-0"]),
            vec![env_var("LOCAL_ONLY", "1"), env_var("ROLE", "replica")]
        );
        assert_eq!(main_env(&world.units["mysql-1"]), vec![env_var("ROLE", "replica")]);
        let last = world.status_patches.last().unwrap();
        assert_eq!(last["imageSyncStatus"]["status"], true);
    }

    /// Story: Observed nodes fill the pinning map without touching null entries
    #[tokio::test]
    async fn story_node_pins_are_recorded() {
        let mut us = sample_unitset("8.0.40", 3);
        us.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_NODE_NAME_MAP.to_string(),
            r#"{"mysql-1":null}"#.to_string(),
        )]));
        let world = shared(seeded_world("8.0.40", 3), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        let map = parse_node_map(world.unitset.as_ref().unwrap().annotations());
        assert_eq!(map["mysql-0"].as_deref(), Some("node-0"));
        assert_eq!(map["mysql-1"], None);
        assert_eq!(map["mysql-2"].as_deref(), Some("node-2"));
        // The null entry reaches the unit so its pod is never pinned
        assert_eq!(world.units["mysql-1"].annotations()[ANNOTATION_NODE_UNPINNED], "true");
        assert!(!world.units["mysql-0"]
            .annotations()
            .contains_key(ANNOTATION_NODE_UNPINNED));
    }

    /// Story: Services are created once and NodePorts are remembered
    #[tokio::test]
    async fn story_node_ports_are_recorded() {
        let mut us = sample_unitset("8.0.40", 1);
        us.spec.external_service = ServiceExposure {
            type_: Some("NodePort".to_string()),
        };
        let world = shared(seeded_world("8.0.40", 1), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        assert!(world.services.contains_key("mysql-headless-svc"));
        assert!(world.services.contains_key("mysql-svc"));
        let annotations = world.unitset.as_ref().unwrap().annotations();
        assert_eq!(
            external_reservations(annotations),
            NodePortMap::from([("mysql".to_string(), 30000)])
        );
    }

    /// Story: A rejected NodePort reservation is released and retried later
    #[tokio::test]
    async fn story_rejected_reservation_is_cleared() {
        let mut us = sample_unitset("8.0.40", 1);
        us.spec.external_service = ServiceExposure {
            type_: Some("NodePort".to_string()),
        };
        us.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_EXTERNAL_NODEPORTS.to_string(),
            r#"{"mysql":30306}"#.to_string(),
        )]));
        let mut world = seeded_world("8.0.40", 1);
        world.reject_node_ports = true;
        let world = shared(world, &us);

        let err = reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let world = world.lock().unwrap();
        assert!(!world
            .unitset
            .as_ref()
            .unwrap()
            .annotations()
            .contains_key(ANNOTATION_EXTERNAL_NODEPORTS));
        assert!(!world.services.contains_key("mysql-svc"));
    }

    /// Story: Certificates and the PodMonitor are applied per declaration
    #[tokio::test]
    async fn story_certificates_and_monitor() {
        use kunit_common::crd::{CertificateProfile, PodMonitorSpec};

        let mut us = sample_unitset("8.0.40", 2);
        us.spec.certificate = Some(CertificateProfile {
            organizations: vec![],
            root_secret: "root-ca".to_string(),
        });
        us.spec.pod_monitor = PodMonitorSpec {
            enabled: true,
            endpoints: vec![],
        };
        let world = shared(seeded_world("8.0.40", 2), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let mut objects = world.lock().unwrap().custom_objects.clone();
        objects.sort();
        assert_eq!(
            objects,
            vec![
                "Certificate/mysql-0-certificate",
                "Certificate/mysql-1-certificate",
                "Issuer/mysql-0-issuer",
                "Issuer/mysql-1-issuer",
                "PodMonitor/mysql",
            ]
        );
    }

    /// Story: A missing golden template is a hard precondition failure
    #[tokio::test]
    async fn story_missing_golden_template_blocks() {
        let us = sample_unitset("9.9.9", 1);
        let world = shared(seeded_world("8.0.40", 0), &us);

        let err = reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert!(!err.is_retryable());
        assert!(world.lock().unwrap().units.is_empty());
    }

    /// Story: An invalid spec fails validation before touching the cluster
    #[tokio::test]
    async fn story_invalid_spec_waits_for_change() {
        let mut us = sample_unitset("8.0.40", 1);
        us.spec.update_strategy.rolling_update.max_unavailable = 0;
        let context = ctx(MockUnitSetKube::new());

        let err = reconcile(Arc::new(us.clone()), context.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(error_policy(Arc::new(us), &err, context), Action::await_change());
    }

    /// Story: Maintenance mode touches nothing
    #[tokio::test]
    async fn story_maintenance_skips_convergence() {
        let mut us = sample_unitset("8.0.41", 3);
        us.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_MAINTENANCE.to_string(),
            "true".to_string(),
        )]));

        let action = reconcile(Arc::new(us), ctx(MockUnitSetKube::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn transient_errors_requeue_on_error_interval() {
        let context = ctx(MockUnitSetKube::new());
        let action = error_policy(
            Arc::new(sample_unitset("8.0.40", 1)),
            &Error::internal("boom"),
            context,
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
    }

    // =========================================================================
    // Deletion Story Tests
    // =========================================================================

    fn deleting(us: &mut UnitSet) {
        us.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    }

    /// Story: Units are removed before the config they read
    #[tokio::test]
    async fn story_deletion_releases_finalizers_in_order() {
        let mut us = sample_unitset("8.0.40", 2);
        deleting(&mut us);
        let world = shared(seeded_world("8.0.40", 2), &us);

        let action = reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let world = world.lock().unwrap();
        assert!(world.units.is_empty());
        assert!(!world.config_maps.contains_key(&key(NS, "mysql-config-template")));
        assert!(world.unitset.as_ref().unwrap().finalizers().is_empty());

        let position = |prefix: &str| world.log.iter().position(|l| l.starts_with(prefix)).unwrap();
        let last_unit_delete = world
            .log
            .iter()
            .rposition(|l| l.starts_with("delete unit"))
            .unwrap();
        assert!(last_unit_delete < position("finalizers"));
        assert!(position("finalizers") < position("delete config"));
        assert!(world.log.iter().all(|l| !l.contains("grace=Some(0)")));
    }

    /// Story: Force deletion cascades the force flag to every unit
    #[tokio::test]
    async fn story_force_delete_cascades_to_units() {
        let mut us = sample_unitset("8.0.40", 2);
        deleting(&mut us);
        us.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_FORCE_DELETE.to_string(),
            "true".to_string(),
        )]));
        let world = shared(seeded_world("8.0.40", 2), &us);

        reconcile(Arc::new(us), ctx(mock_world(&world)))
            .await
            .unwrap();

        let world = world.lock().unwrap();
        for unit in ["mysql-0", "mysql-1"] {
            let patched = world
                .log
                .iter()
                .position(|l| l == &format!("patch unit {}", unit))
                .unwrap();
            let deleted = world
                .log
                .iter()
                .position(|l| l == &format!("delete unit {} grace=Some(0)", unit))
                .unwrap();
            assert!(patched < deleted);
        }
    }

    /// Story: Units that linger keep the unit finalizer in place
    #[tokio::test]
    async fn story_lingering_units_keep_finalizer() {
        let mut us = sample_unitset("8.0.40", 1);
        deleting(&mut us);
        let world = shared(seeded_world("8.0.40", 1), &us);
        let mut mock = MockUnitSetKube::new();
        let unit = world.lock().unwrap().units["mysql-0"].clone();
        mock.expect_list_units()
            .returning(move |_, _| Ok(vec![unit.clone()]));
        mock.expect_delete_unit().returning(|_, _, _| Ok(()));
        mock.expect_patch_unitset().times(0);
        mock.expect_delete_config_map().times(0);

        let err = reconcile(Arc::new(us), ctx(mock)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn fleet_template_is_stamped_with_declared_version() {
        let us = sample_unitset("8.0.41", 1);
        let mut source = golden("8.0.41");
        source.metadata.annotations.as_mut().unwrap().insert(
            ANNOTATION_LAST_APPLIED.to_string(),
            "{}".to_string(),
        );
        let fleet = fleet_pod_template(&us, &source).unwrap();
        assert_eq!(fleet.metadata.name.as_deref(), Some("mysql-pod-template"));
        assert_eq!(fleet.metadata.namespace.as_deref(), Some(NS));
        let annotations = fleet.metadata.annotations.clone().unwrap();
        assert_eq!(annotations[ANNOTATION_MAIN_CONTAINER_VERSION], "8.0.41");
        assert_eq!(annotations[ANNOTATION_MAIN_CONTAINER], "mysql");
        assert!(!annotations.contains_key(ANNOTATION_LAST_APPLIED));
        assert_eq!(fleet.template, source.template);

        // Same version, different content: the stamped hash moves
        source.template.as_mut().unwrap().spec.as_mut().unwrap().containers[1].image =
            Some("agent:2".to_string());
        let edited = fleet_pod_template(&us, &source).unwrap();
        assert_ne!(fleet_template_hash(&edited), fleet_template_hash(&fleet));
        assert_eq!(
            edited.annotations()[ANNOTATION_MAIN_CONTAINER_VERSION],
            annotations[ANNOTATION_MAIN_CONTAINER_VERSION]
        );
    }

    #[test]
    fn unit_services_are_optional() {
        let us = sample_unitset("8.0.40", 1);
        assert!(unit_service(&us, "mysql-0", &golden("8.0.40"), &NodePortMap::new()).is_none());
    }
}
