//! Control plane API client for the agent.
//!
//! Provides methods for communicating with the control plane:
//! - Fetching the desired apps for this agent
//! - Minting per-app access keys
//! - Reporting containers and host info
//!
//! Every call is independent and bearer-authenticated with the agent token.
//! Nothing is retried here; failures surface as `TransportError`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::{debug, error};

use crate::config::Config;
use crate::engine::{Container, HostInfo};
use crate::error::TransportError;

/// A desired application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct App {
    /// App id; also the container name on this host.
    #[serde(rename = "_id", alias = "id")]
    pub id: String,

    /// Image reference to run.
    pub image: String,

    /// Run in the host network namespace.
    #[serde(rename = "isHostNetwork", default, deserialize_with = "null_as_default")]
    pub is_host_network: bool,

    /// Extra `KEY=VALUE` environment entries, in order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub envs: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct AccessKeyResponse {
    token: String,
}

/// Control plane interface.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the desired apps for this agent.
    async fn fetch_apps(&self) -> Result<Vec<App>, TransportError>;

    /// Mint an access token for `app_id`.
    async fn mint_access_key(&self, app_id: &str) -> Result<String, TransportError>;

    /// Report the current container snapshot.
    async fn push_containers(&self, containers: &[Container]) -> Result<(), TransportError>;

    /// Report host information.
    async fn push_host_info(&self, info: &HostInfo) -> Result<(), TransportError>;
}

/// HTTP control plane client.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
    agent_token: String,
}

impl HttpControlPlane {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/api/v1", config.api_url.trim_end_matches('/')),
            agent_id: config.agent_id.clone(),
            agent_token: config.agent_token.clone(),
        })
    }

    async fn check(
        response: reqwest::Response,
        what: &'static str,
    ) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, what, "Control plane request failed");
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_apps(&self) -> Result<Vec<App>, TransportError> {
        let url = format!("{}/agents/{}/apps", self.base_url, self.agent_id);
        debug!(url = %url, "Fetching agent apps");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.agent_token)
            .send()
            .await?;
        let apps: Vec<App> = Self::check(response, "fetch_apps").await?.json().await?;

        debug!(app_count = apps.len(), "Fetched agent apps");
        Ok(apps)
    }

    async fn mint_access_key(&self, app_id: &str) -> Result<String, TransportError> {
        let url = format!("{}/apps/{}/generateAccessKey", self.base_url, app_id);
        debug!(app_id = %app_id, "Minting app access key");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.agent_token)
            .send()
            .await?;
        let key: AccessKeyResponse = Self::check(response, "mint_access_key")
            .await?
            .json()
            .await?;

        Ok(key.token)
    }

    async fn push_containers(&self, containers: &[Container]) -> Result<(), TransportError> {
        let url = format!("{}/agents/{}/containers", self.base_url, self.agent_id);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.agent_token)
            .json(containers)
            .send()
            .await?;
        Self::check(response, "push_containers").await?;

        debug!(container_count = containers.len(), "Containers published");
        Ok(())
    }

    async fn push_host_info(&self, info: &HostInfo) -> Result<(), TransportError> {
        let url = format!("{}/agents/{}/info", self.base_url, self.agent_id);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.agent_token)
            .json(info)
            .send()
            .await?;
        Self::check(response, "push_host_info").await?;

        debug!("Host info published");
        Ok(())
    }
}

/// A call observed by `MockControlPlane`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPlaneCall {
    FetchApps,
    MintAccessKey(String),
    PushContainers(Vec<Container>),
    PushHostInfo(HostInfo),
}

/// Mock control plane for testing and development.
#[derive(Default)]
pub struct MockControlPlane {
    apps: Mutex<Vec<App>>,
    calls: Mutex<Vec<ControlPlaneCall>>,

    /// Whether every call should fail.
    fail_calls: bool,
}

impl MockControlPlane {
    /// Create a mock serving `apps`.
    pub fn new(apps: Vec<App>) -> Self {
        Self {
            apps: Mutex::new(apps),
            ..Self::default()
        }
    }

    /// Create a mock whose calls all fail with a 503.
    pub fn failing() -> Self {
        Self {
            fail_calls: true,
            ..Self::default()
        }
    }

    /// Replace the apps served by `fetch_apps`.
    pub fn set_apps(&self, apps: Vec<App>) {
        if let Ok(mut current) = self.apps.lock() {
            *current = apps;
        }
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Number of observed calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&ControlPlaneCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ControlPlaneCall) -> Result<(), TransportError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.fail_calls {
            return Err(TransportError::Status {
                status: 503,
                body: "control plane unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn fetch_apps(&self) -> Result<Vec<App>, TransportError> {
        self.record(ControlPlaneCall::FetchApps)?;
        Ok(self
            .apps
            .lock()
            .map(|apps| apps.clone())
            .unwrap_or_default())
    }

    async fn mint_access_key(&self, app_id: &str) -> Result<String, TransportError> {
        self.record(ControlPlaneCall::MintAccessKey(app_id.to_string()))?;
        Ok(format!("token-{app_id}"))
    }

    async fn push_containers(&self, containers: &[Container]) -> Result<(), TransportError> {
        self.record(ControlPlaneCall::PushContainers(containers.to_vec()))
    }

    async fn push_host_info(&self, info: &HostInfo) -> Result<(), TransportError> {
        self.record(ControlPlaneCall::PushHostInfo(info.clone()))
    }
}
