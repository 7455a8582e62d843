//! In-memory engine for testing and development.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Container, ContainerSpec, Engine, EngineEvent, HostInfo, ImageSummary, PullProgress};
use crate::error::EngineError;

/// A call observed by the mock engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ListContainers,
    ListImages,
    Pull(String),
    Create(ContainerSpec),
    Start(String),
    Stop(String),
    Remove(String),
    HostInfo,
    StreamEvents,
}

#[derive(Default)]
struct MockState {
    containers: Vec<Container>,
    images: Vec<ImageSummary>,
    calls: Vec<EngineCall>,
    event_sessions: VecDeque<Vec<EngineEvent>>,
    next_id: u64,
}

/// Mock engine that keeps containers in memory.
///
/// Container names are unique, as in a real engine: a second create with a
/// name already present fails with `EngineError::Conflict`.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,

    /// Whether pulls should fail.
    fail_pulls: bool,
}

impl MockEngine {
    /// Create an empty mock engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock engine that fails every pull.
    pub fn failing_pulls() -> Self {
        Self {
            fail_pulls: true,
            ..Self::default()
        }
    }

    /// Seed the engine with existing containers.
    pub fn with_containers(self, containers: Vec<Container>) -> Self {
        self.lock().containers = containers;
        self
    }

    /// Queue one event-stream session; each subscription consumes one.
    ///
    /// A subscription with no queued session stays open without events.
    pub fn push_event_session(&self, events: Vec<EngineEvent>) {
        self.lock().event_sessions.push_back(events);
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of observed calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Current containers.
    pub fn containers(&self) -> Vec<Container> {
        self.lock().containers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    fn update_status(&self, id: &str, status: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.status = status.to_string();
        Ok(())
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn list_containers(&self) -> Result<Vec<Container>, EngineError> {
        self.record(EngineCall::ListContainers);
        Ok(self.containers())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        self.record(EngineCall::ListImages);
        Ok(self.lock().images.clone())
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: mpsc::UnboundedSender<PullProgress>,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::Pull(image.to_string()));

        if self.fail_pulls {
            return Err(EngineError::NotFound(format!("manifest for {image} not found")));
        }

        let (repo, tag) = super::split_image_ref(image);
        let _ = progress.send(PullProgress {
            status: format!("Pulling from {repo}"),
            id: tag.to_string(),
        });
        tokio::task::yield_now().await;
        let _ = progress.send(PullProgress {
            status: "Pull complete".to_string(),
            id: "layer0".to_string(),
        });

        let mut state = self.lock();
        if !state.images.iter().any(|i| i.repo_tags.iter().any(|t| t == image)) {
            let id = format!("sha256:{:016x}", state.images.len());
            state.images.push(ImageSummary {
                id,
                repo_tags: vec![image.to_string()],
            });
        }

        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(EngineCall::Create(spec.clone()));
        tokio::task::yield_now().await;

        let name = format!("/{}", spec.name);
        let mut state = self.lock();
        if state.containers.iter().any(|c| c.has_name(&name)) {
            return Err(EngineError::Conflict(format!(
                "the container name \"{name}\" is already in use"
            )));
        }

        state.next_id += 1;
        let id = format!("mock{:012x}", state.next_id);
        state.containers.push(Container {
            id: id.clone(),
            names: vec![name],
            image: spec.image.clone(),
            status: "Up".to_string(),
        });

        info!(container_id = %id, name = %spec.name, "[MOCK] Container started");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(id.to_string()));
        self.update_status(id, "Up")
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Stop(id.to_string()));
        self.update_status(id, "Exited (0)")
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(id.to_string()));

        let mut state = self.lock();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn host_info(&self) -> Result<HostInfo, EngineError> {
        self.record(EngineCall::HostInfo);
        let containers = self.lock().containers.len();
        Ok(HostInfo(serde_json::json!({
            "Name": "mock-host",
            "Containers": containers,
            "OperatingSystem": "mock",
        })))
    }

    async fn stream_events(&self, events: mpsc::Sender<EngineEvent>) -> Result<(), EngineError> {
        let session = {
            let mut state = self.lock();
            state.calls.push(EngineCall::StreamEvents);
            state.event_sessions.pop_front()
        };

        let Some(session) = session else {
            debug!("[MOCK] No queued event session, holding stream open");
            std::future::pending::<()>().await;
            return Ok(());
        };

        for event in session {
            if events.send(event).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}
