//! Finalizer-gated teardown shared by both controllers.
//!
//! Each finalizer guards one class of dependents. When the owner is being
//! deleted, every guarded class walks the same state machine:
//!
//! ```text
//! Present -> DeletingDependents -> WaitingForDisappearance -> FinalizerRemoved
//! ```
//!
//! The finalizer is released only once the dependents are confirmed gone. A
//! dependent stuck on its own finalizer makes the wait time out, and the
//! owner's finalizer stays in place.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::kube_utils::poll_until;
use crate::Error;

/// Phase of one finalizer's teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionPhase {
    /// Finalizer set, nothing issued yet
    Present,
    /// Delete calls issued
    DeletingDependents,
    /// Waiting for dependents to vanish
    WaitingForDisappearance,
    /// Dependents gone, finalizer may be removed
    FinalizerRemoved,
}

impl std::fmt::Display for DeletionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present => write!(f, "Present"),
            Self::DeletingDependents => write!(f, "DeletingDependents"),
            Self::WaitingForDisappearance => write!(f, "WaitingForDisappearance"),
            Self::FinalizerRemoved => write!(f, "FinalizerRemoved"),
        }
    }
}

/// One class of dependents guarded by a finalizer
#[async_trait]
pub trait DependentSet: Send + Sync {
    /// Finalizer guarding this class
    fn finalizer(&self) -> &'static str;

    /// Issue deletes for every dependent, concurrently, aggregating failures.
    ///
    /// `force` deletes with a zero grace period and cascades to the
    /// low-level objects the dependents are bound to.
    async fn delete_all(&self, force: bool) -> Result<(), Error>;

    /// Number of dependents still present
    async fn remaining(&self) -> Result<usize, Error>;
}

/// Timing of the disappearance wait
#[derive(Clone, Debug)]
pub struct DeletionWait {
    /// Upper bound on the wait
    pub timeout: Duration,
    /// Interval between checks
    pub poll_interval: Duration,
}

/// Drive one dependent class to absence.
///
/// Returns `Ok(())` when the caller may remove the finalizer. Delete failures
/// are returned without waiting, so the finalizer stays until a later pass
/// succeeds.
pub async fn tear_down(
    owner: &str,
    dependents: &dyn DependentSet,
    force: bool,
    wait: &DeletionWait,
    cancel: &CancellationToken,
) -> Result<DeletionPhase, Error> {
    let finalizer = dependents.finalizer();
    debug!(owner, finalizer, phase = %DeletionPhase::Present, "tearing down dependents");

    debug!(owner, finalizer, phase = %DeletionPhase::DeletingDependents, force, "issuing deletes");
    dependents.delete_all(force).await?;

    debug!(owner, finalizer, phase = %DeletionPhase::WaitingForDisappearance, "waiting for dependents");
    poll_until(
        wait.timeout,
        wait.poll_interval,
        cancel,
        format!("{} dependents of {} to disappear", finalizer, owner),
        move || async move { Ok(dependents.remaining().await? == 0) },
    )
    .await?;

    info!(owner, finalizer, "dependents gone, releasing finalizer");
    Ok(DeletionPhase::FinalizerRemoved)
}
