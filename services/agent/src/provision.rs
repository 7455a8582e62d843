//! App provisioning: access key, image pull, container create.
//!
//! Provisioning is a straight line with no rollback. A failure at any step
//! leaves the app unprovisioned until a later reconciliation pass tries again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::LogPublisher;
use crate::client::{App, ControlPlane};
use crate::engine::{ContainerSpec, Engine, PullProgress};
use crate::error::AgentError;

/// Environment variable carrying the app id into its container.
pub const APP_ID_ENV: &str = "FORA_APP_ID";

/// Environment variable carrying the minted access token.
pub const APP_TOKEN_ENV: &str = "FORA_APP_TOKEN";

/// Container environment for `app`: identity first, then the app's own envs.
pub fn app_env(app: &App, token: &str) -> Vec<String> {
    let mut env = Vec::with_capacity(app.envs.len() + 2);
    env.push(format!("{APP_ID_ENV}={}", app.id));
    env.push(format!("{APP_TOKEN_ENV}={token}"));
    env.extend(app.envs.iter().cloned());
    env
}

/// Creates containers for desired apps.
#[derive(Clone)]
pub struct Provisioner {
    engine: Arc<dyn Engine>,
    control_plane: Arc<dyn ControlPlane>,
    log: Arc<dyn LogPublisher>,
}

impl Provisioner {
    pub fn new(
        engine: Arc<dyn Engine>,
        control_plane: Arc<dyn ControlPlane>,
        log: Arc<dyn LogPublisher>,
    ) -> Self {
        Self {
            engine,
            control_plane,
            log,
        }
    }

    /// Mint an access key for `app` and create its container.
    ///
    /// Returns the new container id.
    pub async fn provision(&self, app: &App) -> Result<String, AgentError> {
        info!(app_id = %app.id, image = %app.image, "Provisioning app");

        let token = self.control_plane.mint_access_key(&app.id).await?;
        let spec = ContainerSpec {
            image: app.image.clone(),
            name: app.id.clone(),
            env: app_env(app, &token),
            host_network: app.is_host_network,
        };

        self.create_app_container(&spec).await
    }

    /// Pull `spec.image`, then create and start the container.
    ///
    /// Pull progress is published as `<status>:<id>` log lines.
    pub async fn create_app_container(&self, spec: &ContainerSpec) -> Result<String, AgentError> {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let (pulled, forwarded) = tokio::join!(
            self.engine.pull_image(&spec.image, progress_tx),
            forward_progress(self.log.as_ref(), progress_rx),
        );
        pulled?;
        debug!(image = %spec.image, lines = forwarded, "Image pull complete");

        let container_id = self.engine.create_and_start(spec).await?;
        info!(
            container_id = %container_id,
            name = %spec.name,
            host_network = spec.host_network,
            "App container running"
        );

        Ok(container_id)
    }
}

async fn forward_progress(
    log: &dyn LogPublisher,
    mut progress: mpsc::UnboundedReceiver<PullProgress>,
) -> usize {
    let mut lines = 0;
    while let Some(event) = progress.recv().await {
        log.publish_log(event.to_string()).await;
        lines += 1;
    }
    lines
}
