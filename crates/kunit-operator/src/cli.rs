//! Command line of the operator binary
//!
//! Every tunable has an environment fallback so the operator can be configured
//! from its Deployment manifest alone.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use kunit_common::telemetry::{LogRotation, TelemetryConfig};
use kunit_common::{AgentHostType, OperatorConfig, DEFAULT_MANAGER_NAMESPACE};

/// kunit - operator for fleets of stateful workload instances
#[derive(Parser, Debug)]
#[command(name = "kunit-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace holding the golden pod templates and config sources
    #[arg(long, env = "KUNIT_MANAGER_NAMESPACE", default_value = DEFAULT_MANAGER_NAMESPACE)]
    pub manager_namespace: String,

    /// How the sidecar agent is addressed (domain or ip)
    #[arg(long, env = "KUNIT_AGENT_HOST_TYPE", default_value = "domain")]
    pub agent_host_type: AgentHostType,

    /// Sidecar agent port
    #[arg(long, env = "KUNIT_AGENT_PORT", default_value_t = 2214)]
    pub agent_port: u16,

    /// Timeout of one sidecar agent request, in seconds
    #[arg(long, env = "KUNIT_AGENT_TIMEOUT_SECS", default_value_t = 10)]
    pub agent_timeout_secs: u64,

    /// Requeue interval after a successful pass, in seconds
    #[arg(long, env = "KUNIT_REQUEUE_INTERVAL_SECS", default_value_t = 30)]
    pub requeue_interval_secs: u64,

    /// Requeue interval after a failed pass, in seconds
    #[arg(long, env = "KUNIT_ERROR_REQUEUE_INTERVAL_SECS", default_value_t = 15)]
    pub error_requeue_interval_secs: u64,

    /// Interval between polls of bounded waits, in seconds
    #[arg(long, env = "KUNIT_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub poll_interval_secs: u64,

    /// How long to wait for deleted dependents to disappear, in seconds
    #[arg(long, env = "KUNIT_DELETE_TIMEOUT_SECS", default_value_t = 120)]
    pub delete_timeout_secs: u64,

    /// How long a rolling update waits for one unit to become ready, in seconds
    #[arg(long, env = "KUNIT_READY_TIMEOUT_SECS", default_value_t = 600)]
    pub ready_timeout_secs: u64,

    /// Attempts of a write that hits a resourceVersion conflict
    #[arg(long, env = "KUNIT_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Concurrent reconciles per controller
    #[arg(long, env = "KUNIT_CONCURRENCY", default_value_t = 10)]
    pub concurrency: u16,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "KUNIT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Directory for rolling log files (stdout only when unset)
    #[arg(long, env = "KUNIT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log file rotation (hourly, daily or never)
    #[arg(long, env = "KUNIT_LOG_ROTATION", default_value = "daily")]
    pub log_rotation: LogRotation,
}

impl Cli {
    /// Configuration handed to both controllers
    pub fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            manager_namespace: self.manager_namespace.clone(),
            agent_host_type: self.agent_host_type,
            agent_port: self.agent_port,
            agent_timeout: Duration::from_secs(self.agent_timeout_secs),
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
            error_requeue_interval: Duration::from_secs(self.error_requeue_interval_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            conflict_retries: self.conflict_retries.max(1),
            concurrency: self.concurrency.max(1),
        }
    }

    /// Logging setup
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            rotation: self.log_rotation,
            ..Default::default()
        }
    }
}
