//! Unit controller for kunit
//!
//! Converges a single Unit onto its pod, claims and workload process:
//!
//! - **Agent**: HTTP client for the sidecar that syncs config and starts/stops the process
//! - **Drift**: Decides between no-op, in-place patch and pod recreation
//! - **Status**: Aggregates pod, node and claim observations into `UnitStatus`
//! - **Controller**: The reconcile loop, deletion and error policy

pub mod agent;
pub mod controller;
pub mod drift;
pub mod status;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, UnitKube, UnitKubeImpl};
