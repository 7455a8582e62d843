//! Docker engine implementation backed by bollard.

use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, EventsOptions,
        ListContainersOptionsBuilder, ListImagesOptionsBuilder, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    Docker, API_DEFAULT_VERSION,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    split_image_ref, Container, ContainerSpec, Engine, EngineEvent, HostInfo, ImageSummary,
    PullProgress,
};
use crate::error::EngineError;

/// Request timeout for engine calls, in seconds.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Engine gateway over the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon listening on `socket_path`.
    pub fn connect(socket_path: &str) -> Result<Self, EngineError> {
        let docker =
            Docker::connect_with_socket(socket_path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        info!(socket = %socket_path, "Connected to Docker engine");
        Ok(Self { docker })
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            other => EngineError::Api(other.to_string()),
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn list_containers(&self) -> Result<Vec<Container>, EngineError> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let summaries = self.docker.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .map(|c| Container {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let options = ListImagesOptionsBuilder::new().all(true).build();
        let images = self.docker.list_images(Some(options)).await?;

        Ok(images
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags,
            })
            .collect())
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: mpsc::UnboundedSender<PullProgress>,
    ) -> Result<(), EngineError> {
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptionsBuilder::new()
            .from_image(from_image)
            .tag(tag)
            .build();

        debug!(image = %image, "Pulling image");
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item?;
            let _ = progress.send(PullProgress {
                status: info.status.unwrap_or_default(),
                id: info.id.unwrap_or_default(),
            });
        }

        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let host_config = spec.host_network.then(|| HostConfig {
            network_mode: Some("host".to_string()),
            ..HostConfig::default()
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            host_config,
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;

        info!(
            container_id = %created.id,
            name = %spec.name,
            image = %spec.image,
            "Container created and started"
        );

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn host_info(&self) -> Result<HostInfo, EngineError> {
        let info = self.docker.info().await?;
        let value = serde_json::to_value(info).map_err(|e| EngineError::Api(e.to_string()))?;
        Ok(HostInfo(value))
    }

    async fn stream_events(&self, events: mpsc::Sender<EngineEvent>) -> Result<(), EngineError> {
        let mut stream = self.docker.events(None::<EventsOptions>);

        while let Some(item) = stream.next().await {
            let message = item?;
            let event = EngineEvent {
                kind: message.typ.map(|t| t.to_string()).unwrap_or_default(),
                action: message.action.unwrap_or_default(),
                attributes: message
                    .actor
                    .and_then(|actor| actor.attributes)
                    .map(|attrs| attrs.into_iter().collect())
                    .unwrap_or_default(),
            };

            if events.send(event).await.is_err() {
                debug!("Event receiver dropped, closing engine event stream");
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bollard_error_mapping() {
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Conflict. The container name \"/app1\" is already in use".to_string(),
        };
        assert!(matches!(EngineError::from(conflict), EngineError::Conflict(_)));

        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".to_string(),
        };
        assert!(matches!(EngineError::from(missing), EngineError::NotFound(_)));

        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(EngineError::from(other), EngineError::Api(_)));
    }
}
