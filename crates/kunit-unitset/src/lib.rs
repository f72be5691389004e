//! UnitSet controller for kunit
//!
//! Expands a fleet declaration into `units` Units and the shared artifacts
//! they need, then keeps them converged:
//!
//! - **Template**: Unit rendering, template merge and fleet-shape propagation
//! - **Config**: Versioned config template and per-unit values
//! - **Services**: Headless, external and per-unit services with NodePort reuse
//! - **Artifacts**: Certificates, PodMonitor, service account and role
//! - **Rollout**: Rolling update batch planning
//! - **Status**: Fleet status aggregation
//! - **Controller**: The reconcile loop, deletion and error policy

pub mod artifacts;
pub mod config;
pub mod controller;
pub mod rollout;
pub mod services;
pub mod status;
pub mod template;

pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, UnitSetKube, UnitSetKubeImpl,
};
