//! Custom Resource Definitions for kunit
//!
//! `UnitSet` declares a fleet, `Unit` is one member of it.

mod types;
mod unit;
mod unitset;

pub use types::SyncStatus;
pub use unit::{Unit, UnitClaimStatus, UnitPhase, UnitSpec, UnitStatus};
pub use unitset::{
    parse_node_map, CertificateProfile, EmptyDirSpec, NodeAffinityPreset, PodAntiAffinity,
    PodMonitorEndpoint, PodMonitorSpec, RollingUpdateSpec, SecretSpec, ServiceExposure,
    StorageSpec, UnitSet, UnitSetSpec, UnitSetStatus, UpdateStrategy, UpdateStrategyType,
};
