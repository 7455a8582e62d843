//! Container engine gateway.
//!
//! The `Engine` trait abstracts the container operations the agent needs:
//! - Listing containers and images
//! - Pulling images and creating/starting containers
//! - Start/stop/remove by id
//! - Host info and the engine event stream
//!
//! `DockerEngine` talks to the local Docker daemon; `MockEngine` is an
//! in-memory engine for tests and development.

mod docker;
mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;

pub use docker::DockerEngine;
pub use mock::{EngineCall, MockEngine};

/// A container as reported by the engine (actual state).
///
/// Serialized in the engine's own list shape so the control plane receives
/// what it would get from the Docker API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub status: String,
}

impl Container {
    /// Whether `name` (e.g. `/app1`) is one of this container's names.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Host-level engine information, kept opaque and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HostInfo(pub serde_json::Value);

/// One progress line of an image pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub id: String,
}

impl std::fmt::Display for PullProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.status, self.id)
    }
}

/// Request to create and start a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference to run.
    pub image: String,

    /// Container name (without the leading slash).
    pub name: String,

    /// Environment, as `KEY=VALUE` strings.
    pub env: Vec<String>,

    /// Run in the host network namespace.
    pub host_network: bool,
}

/// An event from the engine's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Object type (`container`, `image`, `network`, ...).
    pub kind: String,

    /// What happened (`start`, `die`, `pull`, ...).
    pub action: String,

    /// Actor attributes (name, image, exit code, ...).
    pub attributes: BTreeMap<String, String>,
}

/// Container engine interface.
#[async_trait]
pub trait Engine: Send + Sync {
    /// List all containers, including stopped ones.
    async fn list_containers(&self) -> Result<Vec<Container>, EngineError>;

    /// List local images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    /// Pull an image, sending progress lines to `progress`.
    ///
    /// Resolves once the pull has completed.
    async fn pull_image(
        &self,
        image: &str,
        progress: mpsc::UnboundedSender<PullProgress>,
    ) -> Result<(), EngineError>;

    /// Create a container and start it. Returns the container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Start a container by id.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stop a container by id.
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a container by id.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Query host information.
    async fn host_info(&self) -> Result<HostInfo, EngineError>;

    /// Subscribe to the event stream and forward events into `events`.
    ///
    /// Returns when the stream ends, errors, or the receiver is dropped.
    async fn stream_events(&self, events: mpsc::Sender<EngineEvent>) -> Result<(), EngineError>;
}

/// Split an image reference into repository and tag for a pull request.
///
/// A missing tag means `latest`. Digest references are passed through whole
/// with an empty tag.
pub fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}
