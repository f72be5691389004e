//! Controller runner - builds the controller futures of the operator

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use kunit_common::crd::{Unit, UnitSet};
use kunit_common::{OperatorConfig, LABEL_UNIT_NAME};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Unit controller: watches Units, their pods and their claims
pub fn build_unit_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ControllerFuture> {
    let concurrency = config.concurrency;
    let ctx = Arc::new(
        kunit_unit::Context::builder(client.clone())
            .config(config)
            .cancel(cancel)
            .build()?,
    );
    let units: Api<Unit> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let claims: Api<PersistentVolumeClaim> = Api::all(client);

    tracing::info!("- Unit controller");

    Ok(Box::pin(
        Controller::new(units, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .owns(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            // Claims carry no owner reference so they outlive a recreated pod
            .watches(
                claims,
                WatcherConfig::default()
                    .labels(LABEL_UNIT_NAME)
                    .timeout(WATCH_TIMEOUT_SECS),
                claim_owner,
            )
            .shutdown_on_signal()
            .run(kunit_unit::reconcile, kunit_unit::error_policy, ctx)
            .for_each(log_reconcile_result("Unit")),
    ))
}

/// Build the UnitSet controller: watches UnitSets and their Units
pub fn build_unitset_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> ControllerFuture {
    let concurrency = config.concurrency;
    let ctx = Arc::new(
        kunit_unitset::Context::builder(client.clone())
            .config(config)
            .cancel(cancel)
            .build(),
    );
    let unitsets: Api<UnitSet> = Api::all(client.clone());
    let units: Api<Unit> = Api::all(client);

    tracing::info!("- UnitSet controller");

    Box::pin(
        Controller::new(unitsets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .owns(units, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(kunit_unitset::reconcile, kunit_unitset::error_policy, ctx)
            .for_each(log_reconcile_result("UnitSet")),
    )
}

/// Unit a claim belongs to, from its unit-name label
fn claim_owner(claim: PersistentVolumeClaim) -> Option<ObjectRef<Unit>> {
    let unit = claim.metadata.labels.as_ref()?.get(LABEL_UNIT_NAME)?;
    let namespace = claim.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(unit).within(namespace))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
