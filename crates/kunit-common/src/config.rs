//! Process-wide operator configuration
//!
//! Built once by the binary and handed to both controller contexts, so a
//! reconcile never reads ambient global state.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, DEFAULT_MANAGER_NAMESPACE};

/// How the sidecar agent endpoint of a Unit is addressed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AgentHostType {
    /// `{unit}.{headless-service}.{namespace}` DNS name
    #[default]
    Domain,
    /// Pod IP from the pod status
    Ip,
}

impl FromStr for AgentHostType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain),
            "ip" => Ok(Self::Ip),
            other => Err(Error::validation(
                "agent-host-type",
                format!("unknown agent host type '{}', expected domain or ip", other),
            )),
        }
    }
}

impl std::fmt::Display for AgentHostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// Configuration shared by the Unit and UnitSet controllers
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding the golden pod and config templates
    pub manager_namespace: String,
    /// Sidecar agent addressing mode
    pub agent_host_type: AgentHostType,
    /// Sidecar agent port
    pub agent_port: u16,
    /// Timeout for a single sidecar agent request
    pub agent_timeout: Duration,
    /// Safety-net requeue interval after a successful pass
    pub requeue_interval: Duration,
    /// Requeue interval after a failed pass
    pub error_requeue_interval: Duration,
    /// Interval between polls of bounded waits
    pub poll_interval: Duration,
    /// How long to wait for deleted dependents to disappear
    pub delete_timeout: Duration,
    /// How long to wait for a Unit to report Ready during a rolling update
    pub ready_timeout: Duration,
    /// Attempts for optimistic-concurrency retries on status/finalizer writes
    pub conflict_retries: u32,
    /// Maximum concurrent reconciles per controller
    pub concurrency: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            manager_namespace: DEFAULT_MANAGER_NAMESPACE.to_string(),
            agent_host_type: AgentHostType::Domain,
            agent_port: 2214,
            agent_timeout: Duration::from_secs(10),
            requeue_interval: Duration::from_secs(30),
            error_requeue_interval: Duration::from_secs(15),
            poll_interval: Duration::from_secs(2),
            delete_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(600),
            conflict_retries: 5,
            concurrency: 10,
        }
    }
}

impl OperatorConfig {
    /// Short waits and intervals for unit tests
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            delete_timeout: Duration::from_millis(200),
            ready_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }
}
