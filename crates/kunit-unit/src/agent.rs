//! Client for the in-pod sidecar agent
//!
//! The agent runs next to the workload container and exposes config sync and
//! process start/stop over HTTP+JSON:
//!
//! - `POST /v1/config/sync` renders config from the fleet template and unit value
//! - `POST /v1/service/start`, `POST /v1/service/stop`
//! - `GET /v1/service/status` reports the process state

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kunit_common::crd::Unit;
use kunit_common::{naming, AgentHostType, Error, OperatorConfig, LABEL_UNITSET_NAME};

/// Where a unit's agent listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentEndpoint {
    /// Unit the agent belongs to
    pub unit: String,
    /// Base URL, e.g. `http://mysql-0.mysql-headless-svc.db:2214`
    pub base_url: String,
}

/// Resolve the agent endpoint of a unit.
///
/// Domain mode addresses the pod through the fleet's headless service; IP mode
/// uses the pod IP and yields `None` until one is assigned.
pub fn resolve_endpoint(config: &OperatorConfig, unit: &Unit, pod: &Pod) -> Option<AgentEndpoint> {
    let name = unit.metadata.name.clone()?;
    let host = match config.agent_host_type {
        AgentHostType::Domain => {
            let namespace = unit.metadata.namespace.as_deref()?;
            let unitset = unit.metadata.labels.as_ref()?.get(LABEL_UNITSET_NAME)?;
            format!("{}.{}.{}", name, naming::headless_service(unitset), namespace)
        }
        AgentHostType::Ip => pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())?,
    };
    Some(AgentEndpoint {
        unit: name,
        base_url: format!("http://{}:{}", host, config.agent_port),
    })
}

/// Body of a config sync request
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSyncRequest {
    /// Fleet config template ConfigMap
    pub template_name: String,
    /// Unit config value ConfigMap
    pub value_name: String,
    /// Primary container the config is rendered for
    pub main_container: String,
    /// Additional ConfigMaps the agent should render
    pub extra_config_names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentReply {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusReply {
    #[serde(default)]
    state: String,
}

/// Process state reported by the agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is up
    Running,
    /// Process is coming up
    Starting,
    /// Process is down
    Stopped,
    /// Process is shutting down
    Stopping,
    /// Anything else the agent reports
    Other(String),
}

impl ProcessState {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" => Self::Stopped,
            "stopping" => Self::Stopping,
            _ => Self::Other(raw.to_string()),
        }
    }

    /// True while the process is running or coming up
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Starting => write!(f, "starting"),
            Self::Stopped => write!(f, "stopped"),
            Self::Stopping => write!(f, "stopping"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Operations offered by the sidecar agent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SidecarAgent: Send + Sync {
    /// Render config files from the given ConfigMaps
    async fn sync_config(
        &self,
        endpoint: &AgentEndpoint,
        request: &ConfigSyncRequest,
    ) -> Result<(), Error>;

    /// Start the workload process
    async fn start_service(&self, endpoint: &AgentEndpoint) -> Result<(), Error>;

    /// Stop the workload process
    async fn stop_service(&self, endpoint: &AgentEndpoint) -> Result<(), Error>;

    /// Current process state
    async fn service_state(&self, endpoint: &AgentEndpoint) -> Result<ProcessState, Error>;
}

/// HTTP implementation of [`SidecarAgent`]
pub struct HttpSidecarAgent {
    http: reqwest::Client,
}

impl HttpSidecarAgent {
    /// Build a client whose requests are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context("HttpSidecarAgent::new", format!("http client: {}", e))
            })?;
        Ok(Self { http })
    }

    async fn post(
        &self,
        endpoint: &AgentEndpoint,
        path: &str,
        body: Option<&ConfigSyncRequest>,
    ) -> Result<(), Error> {
        let url = format!("{}{}", endpoint.base_url, path);
        debug!(unit = %endpoint.unit, url = %url, "calling agent");

        let request = self.http.post(&url);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::agent(&endpoint.unit, format!("{} failed: {}", path, e)))?;

        let status = response.status();
        let reply: AgentReply = response.json().await.unwrap_or_default();
        if let Some(err) = reply.error.filter(|e| !e.is_empty()) {
            return Err(Error::agent(&endpoint.unit, format!("{}: {}", path, err)));
        }
        if !status.is_success() {
            return Err(Error::agent(
                &endpoint.unit,
                format!("{} returned {}", path, status),
            ));
        }
        debug!(
            unit = %endpoint.unit,
            message = reply.message.as_deref().unwrap_or_default(),
            "agent call succeeded"
        );
        Ok(())
    }
}

#[async_trait]
impl SidecarAgent for HttpSidecarAgent {
    async fn sync_config(
        &self,
        endpoint: &AgentEndpoint,
        request: &ConfigSyncRequest,
    ) -> Result<(), Error> {
        self.post(endpoint, "/v1/config/sync", Some(request)).await
    }

    async fn start_service(&self, endpoint: &AgentEndpoint) -> Result<(), Error> {
        self.post(endpoint, "/v1/service/start", None).await
    }

    async fn stop_service(&self, endpoint: &AgentEndpoint) -> Result<(), Error> {
        self.post(endpoint, "/v1/service/stop", None).await
    }

    async fn service_state(&self, endpoint: &AgentEndpoint) -> Result<ProcessState, Error> {
        let url = format!("{}/v1/service/status", endpoint.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::agent(&endpoint.unit, format!("status failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::agent(
                &endpoint.unit,
                format!("status returned {}", response.status()),
            ));
        }
        let reply: StatusReply = response
            .json()
            .await
            .map_err(|e| Error::agent(&endpoint.unit, format!("invalid status reply: {}", e)))?;
        Ok(ProcessState::parse(&reply.state))
    }
}
