//! Fora Host Agent
//!
//! Keeps the containers on this host in line with the apps the control plane
//! assigns to it.
//!
//! ## Architecture
//!
//! - **Container Supervisor**: Owns actual and desired state, provisions missing apps
//! - **Event Monitor**: Refreshes actual state on container events
//! - **Bus Session**: Online flag, log lines, inbound commands and notifications
//! - **Command Processor**: Turns inbound messages into engine calls and reloads

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fora_agent::actors::{ContainerMessage, ContainerSupervisor, Supervisor};
use fora_agent::bus::{BusSession, LogPublisher};
use fora_agent::client::{ControlPlane, HttpControlPlane};
use fora_agent::commands::CommandProcessor;
use fora_agent::config::Config;
use fora_agent::engine::{DockerEngine, Engine};
use fora_agent::monitor::EventMonitor;
use fora_agent::tasks::{ErrorSink, TracingSink};

/// Capacity of the inbound message channel.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fora agent");
    info!(
        agent_id = %config.agent_id,
        api_url = %config.api_url,
        mqtt_url = %config.mqtt_url,
        docker_socket = %config.docker_socket,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let errors: Arc<dyn ErrorSink> = Arc::new(TracingSink);

    // Gateways
    let engine: Arc<dyn Engine> = Arc::new(
        DockerEngine::connect(&config.docker_socket).context("failed to connect to docker")?,
    );
    let control_plane: Arc<dyn ControlPlane> =
        Arc::new(HttpControlPlane::new(&config).context("failed to build control-plane client")?);
    let (bus, bus_loop) = BusSession::connect(&config, Arc::clone(&errors))
        .context("failed to configure message bus")?;
    let log: Arc<dyn LogPublisher> = Arc::new(bus);

    // State owner
    let mut supervisor = Supervisor::new(shutdown_rx.clone());
    let containers = ContainerSupervisor::spawn(
        &mut supervisor,
        Arc::clone(&engine),
        Arc::clone(&control_plane),
        Arc::clone(&log),
        Arc::clone(&errors),
    );

    // Engine events
    let monitor = EventMonitor::new(Arc::clone(&engine), containers.clone(), Arc::clone(&log));
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    log_image_inventory(engine.as_ref()).await;

    // Initial report and reconcile, in mailbox order
    for msg in [
        ContainerMessage::ReportHostInfo,
        ContainerMessage::RefreshActualState,
        ContainerMessage::ReloadApps,
    ] {
        containers
            .send(msg)
            .await
            .context("container supervisor stopped during startup")?;
    }

    // Bus and inbound commands
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let bus_handle = tokio::spawn(bus_loop.run(inbound_tx, shutdown_rx.clone()));
    let processor = CommandProcessor::new(Arc::clone(&engine), containers, Arc::clone(&errors));
    let processor_handle = tokio::spawn(processor.run(inbound_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = processor_handle => {
            warn!("Command processor exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    supervisor.stop_all().await;

    if let Err(e) = bus_handle.await {
        warn!(error = %e, "Bus event loop task failed");
    }
    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Event monitor task failed");
    }

    info!("Agent shutdown complete");
    Ok(())
}

async fn log_image_inventory(engine: &dyn Engine) {
    match engine.list_images().await {
        Ok(images) => {
            info!(image_count = images.len(), "Local images");
            for image in &images {
                debug!(image_id = %image.id, tags = ?image.repo_tags, "Local image");
            }
        }
        Err(e) => warn!(error = %e, "Failed to list local images"),
    }
}
