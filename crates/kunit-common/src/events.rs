//! Kubernetes Event recording for kunit controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.
//!
//! Controllers describe what happened with [`KunitEvent`]; the reason, action,
//! type and note shown by `kubectl` all derive from it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::Error;

/// Something a kunit controller did to, or failed to do for, a Unit or UnitSet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KunitEvent {
    /// Pod created for a Unit
    PodCreated {
        /// Pod name
        pod: String,
    },
    /// Pod deleted and created again because the primary container drifted
    PodRecreated {
        /// Drift found, `; ` separated
        drift: String,
    },
    /// Claim storage request grown
    StorageExpanded {
        /// Claim name
        claim: String,
        /// Previous request
        from: String,
        /// New request
        to: String,
    },
    /// Config artifacts pushed to the sidecar agent
    ConfigSynced {
        /// Config template ConfigMap
        template: String,
        /// Config value ConfigMap
        value: String,
    },
    /// Units created or deleted to match the declared count
    Scaled {
        /// Units created
        created: usize,
        /// Units deleted
        deleted: usize,
    },
    /// A rollout batch became ready on the fleet template
    UnitsUpdated {
        /// Comma separated unit names
        units: String,
        /// Declared version
        version: String,
    },
    /// Dependents deleted and finalizers released
    CleanupComplete {
        /// What was removed, e.g. "pod and claims"
        dependents: &'static str,
        /// Owner name
        owner: String,
    },
    /// Reconcile pass failed with a retryable error
    ReconcileFailed {
        /// Error text
        error: String,
    },
    /// Spec rejected, waiting for an edit
    ValidationFailed {
        /// Error text
        error: String,
    },
}

impl KunitEvent {
    /// Failure event for a reconcile error
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Validation { .. } => Self::ValidationFailed {
                error: error.to_string(),
            },
            _ => Self::ReconcileFailed {
                error: error.to_string(),
            },
        }
    }

    /// Normal or Warning
    pub fn type_(&self) -> EventType {
        match self {
            Self::ReconcileFailed { .. } | Self::ValidationFailed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } => reasons::POD_CREATED,
            Self::PodRecreated { .. } => reasons::POD_RECREATED,
            Self::StorageExpanded { .. } => reasons::STORAGE_EXPANDED,
            Self::ConfigSynced { .. } => reasons::CONFIG_SYNCED,
            Self::Scaled { .. } => reasons::SCALED,
            Self::UnitsUpdated { .. } => reasons::UNIT_UPDATED,
            Self::CleanupComplete { .. } => reasons::CLEANUP_COMPLETE,
            Self::ReconcileFailed { .. } => reasons::RECONCILE_FAILED,
            Self::ValidationFailed { .. } => reasons::VALIDATION_FAILED,
        }
    }

    /// Action the controller was taking
    pub fn action(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } => actions::CREATE,
            Self::PodRecreated { .. }
            | Self::StorageExpanded { .. }
            | Self::ConfigSynced { .. }
            | Self::UnitsUpdated { .. } => actions::UPDATE,
            Self::Scaled { .. } => actions::SCALE,
            Self::CleanupComplete { .. } => actions::DELETE,
            Self::ReconcileFailed { .. } | Self::ValidationFailed { .. } => actions::RECONCILE,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            Self::PodCreated { pod } => format!("created pod {}", pod),
            Self::PodRecreated { drift } => drift.clone(),
            Self::StorageExpanded { claim, from, to } => {
                format!("{} expanded from {} to {}", claim, from, to)
            }
            Self::ConfigSynced { template, value } => format!("synced {} and {}", template, value),
            Self::Scaled { created, deleted } => {
                format!("created {} and deleted {} units", created, deleted)
            }
            Self::UnitsUpdated { units, version } => {
                format!("updated {} to version {}", units, version)
            }
            Self::CleanupComplete { dependents, owner } => {
                format!("removed {} of {}", dependents, owner)
            }
            Self::ReconcileFailed { error } | Self::ValidationFailed { error } => error.clone(),
        }
    }
}

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );

    /// Publish a [`KunitEvent`] on the given resource.
    async fn record(&self, resource_ref: &ObjectReference, event: &KunitEvent) {
        self.publish(
            resource_ref,
            event.type_(),
            event.reason(),
            event.action(),
            Some(event.note()),
        )
        .await;
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Reconcile pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Pod was deleted and re-created because of drift
    pub const POD_RECREATED: &str = "PodRecreated";
    /// Pod was created
    pub const POD_CREATED: &str = "PodCreated";
    /// Config artifacts pushed to the sidecar agent
    pub const CONFIG_SYNCED: &str = "ConfigSynced";
    /// Storage claim was expanded
    pub const STORAGE_EXPANDED: &str = "StorageExpanded";
    /// Units created or removed to match the replica count
    pub const SCALED: &str = "Scaled";
    /// A unit finished its rolling update
    pub const UNIT_UPDATED: &str = "UnitUpdated";
    /// Dependents deleted and finalizer released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating or re-creating workload objects
    pub const CREATE: &str = "Create";
    /// Deleting dependents
    pub const DELETE: &str = "Delete";
    /// Scaling the fleet
    pub const SCALE: &str = "Scale";
    /// Rolling update of a unit
    pub const UPDATE: &str = "Update";
}
