//! Types shared between the Unit and UnitSet CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A boolean sync flag with the time it last flipped.
///
/// Equality used for change detection ignores the timestamp, so rewriting
/// the same flag never produces a status write.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the subsystem is in sync
    #[serde(default)]
    pub status: bool,
    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl PartialEq for SyncStatus {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status
    }
}

impl SyncStatus {
    /// Flag with the given value, stamped now
    pub fn new(status: bool) -> Self {
        Self {
            status,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Next value of the flag: keeps the previous timestamp unless it flipped
    pub fn transition(previous: Option<&SyncStatus>, status: bool) -> Self {
        match previous {
            Some(prev) if prev.status == status && prev.last_transition_time.is_some() => {
                prev.clone()
            }
            _ => Self::new(status),
        }
    }
}
