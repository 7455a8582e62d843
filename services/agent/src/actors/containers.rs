//! Container supervisor - single owner of desired and actual state.
//!
//! The ContainerSupervisor:
//! - Owns the actual-state cache (last container list) and the desired-state
//!   cache (last app list)
//! - Serializes every refresh and reconciliation through its mailbox, so a
//!   reconciliation always decides against the latest snapshot
//! - Tracks apps with provisioning in flight, so overlapping passes never
//!   create the same app twice
//!
//! ## Provisioning flow
//!
//! 1. `ReloadApps` fetches desired apps and reconciles them
//! 2. Each missing app is marked in flight and provisioned on its own task
//! 3. The task reports back with `ProvisionFinished`
//! 4. On success the supervisor refreshes actual state, which now holds `/<app>`

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::bus::LogPublisher;
use crate::client::{App, ControlPlane};
use crate::engine::{Container, Engine};
use crate::provision::Provisioner;
use crate::reconciler;
use crate::tasks::{run_reported, spawn_reported, ErrorSink};

/// Mailbox size for the container supervisor.
const MAILBOX_SIZE: usize = 256;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by ContainerSupervisor.
#[derive(Debug)]
pub enum ContainerMessage {
    /// Re-list containers, replace the actual cache and report it.
    RefreshActualState,

    /// Fetch desired apps, replace the desired cache and reconcile.
    ReloadApps,

    /// Reconcile the given apps against the actual cache.
    Reconcile { apps: Vec<App> },

    /// Query host info from the engine and report it.
    ReportHostInfo,

    /// A provisioning task finished.
    ProvisionFinished { app_id: String, succeeded: bool },

    /// Read the current state.
    Snapshot { reply_to: oneshot::Sender<StateSnapshot> },
}

/// Point-in-time view of the supervisor's state.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    /// Actual state: last container list.
    pub containers: Vec<Container>,

    /// Desired state: last app list.
    pub apps: Vec<App>,

    /// App ids with provisioning in flight, sorted.
    pub in_flight: Vec<String>,

    /// Actual-state refreshes performed.
    pub refresh_count: u64,

    /// Reconciliation passes performed.
    pub reconcile_count: u64,
}

// =============================================================================
// Container Supervisor
// =============================================================================

/// Actor reconciling running containers with desired apps.
pub struct ContainerSupervisor {
    engine: Arc<dyn Engine>,
    control_plane: Arc<dyn ControlPlane>,
    provisioner: Provisioner,
    errors: Arc<dyn ErrorSink>,

    /// Own mailbox, for provisioning tasks to report back.
    handle: ActorHandle<ContainerMessage>,

    containers: Vec<Container>,
    apps: Vec<App>,
    in_flight: HashSet<String>,
    refresh_count: u64,
    reconcile_count: u64,
}

impl ContainerSupervisor {
    /// Spawn the container supervisor under `supervisor`.
    pub fn spawn(
        supervisor: &mut Supervisor,
        engine: Arc<dyn Engine>,
        control_plane: Arc<dyn ControlPlane>,
        log: Arc<dyn LogPublisher>,
        errors: Arc<dyn ErrorSink>,
    ) -> ActorHandle<ContainerMessage> {
        supervisor.spawn_with("container_supervisor", MAILBOX_SIZE, move |handle| {
            let provisioner =
                Provisioner::new(Arc::clone(&engine), Arc::clone(&control_plane), log);
            Self {
                engine,
                control_plane,
                provisioner,
                errors,
                handle,
                containers: Vec::new(),
                apps: Vec::new(),
                in_flight: HashSet::new(),
                refresh_count: 0,
                reconcile_count: 0,
            }
        })
    }

    fn snapshot(&self) -> StateSnapshot {
        let mut in_flight: Vec<String> = self.in_flight.iter().cloned().collect();
        in_flight.sort();

        StateSnapshot {
            containers: self.containers.clone(),
            apps: self.apps.clone(),
            in_flight,
            refresh_count: self.refresh_count,
            reconcile_count: self.reconcile_count,
        }
    }

    // -------------------------------------------------------------------------
    // Message Handlers
    // -------------------------------------------------------------------------

    async fn refresh_actual_state(&mut self) {
        self.refresh_count += 1;

        let containers = match self.engine.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.errors.report("refresh_actual_state", &e.into());
                return;
            }
        };

        debug!(container_count = containers.len(), "Actual state refreshed");
        self.containers = containers;

        let snapshot = self.containers.clone();
        let control_plane = Arc::clone(&self.control_plane);
        spawn_reported(Arc::clone(&self.errors), "push_containers", async move {
            control_plane.push_containers(&snapshot).await?;
            Ok(())
        });
    }

    async fn reload_apps(&mut self) {
        let apps = match self.control_plane.fetch_apps().await {
            Ok(apps) => apps,
            Err(e) => {
                self.errors.report("fetch_apps", &e.into());
                return;
            }
        };

        info!(app_count = apps.len(), "Desired apps loaded");
        self.apps = apps.clone();
        self.reconcile(&apps);
    }

    fn reconcile(&mut self, apps: &[App]) {
        self.reconcile_count += 1;

        let plan = reconciler::plan(apps, &self.containers, &self.in_flight);
        info!(
            desired = apps.len(),
            present = plan.present.len(),
            in_flight = plan.in_flight.len(),
            to_provision = plan.to_provision.len(),
            "Reconciling apps"
        );

        for app in plan.to_provision {
            self.in_flight.insert(app.id.clone());
            self.start_provisioning(app);
        }
    }

    fn start_provisioning(&self, app: App) {
        let provisioner = self.provisioner.clone();
        let errors = Arc::clone(&self.errors);
        let handle = self.handle.clone();

        tokio::spawn(async move {
            let succeeded = run_reported(errors.as_ref(), "provision_app", async {
                provisioner.provision(&app).await.map(|_| ())
            })
            .await;

            let msg = ContainerMessage::ProvisionFinished {
                app_id: app.id.clone(),
                succeeded,
            };
            if let Err(e) = handle.send(msg).await {
                warn!(app_id = %app.id, error = %e, "Failed to report provisioning result");
            }
        });
    }

    fn report_host_info(&self) {
        let engine = Arc::clone(&self.engine);
        let control_plane = Arc::clone(&self.control_plane);

        spawn_reported(Arc::clone(&self.errors), "push_host_info", async move {
            let info = engine.host_info().await?;
            control_plane.push_host_info(&info).await?;
            Ok(())
        });
    }

    async fn provision_finished(&mut self, app_id: String, succeeded: bool) {
        self.in_flight.remove(&app_id);

        if succeeded {
            info!(app_id = %app_id, "App provisioned");
            self.refresh_actual_state().await;
        } else {
            warn!(app_id = %app_id, "App provisioning failed, waiting for next pass");
        }
    }
}

#[async_trait]
impl Actor for ContainerSupervisor {
    type Message = ContainerMessage;

    fn name(&self) -> &str {
        "container_supervisor"
    }

    async fn handle(
        &mut self,
        msg: ContainerMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            ContainerMessage::RefreshActualState => {
                self.refresh_actual_state().await;
            }

            ContainerMessage::ReloadApps => {
                self.reload_apps().await;
            }

            ContainerMessage::Reconcile { apps } => {
                self.reconcile(&apps);
            }

            ContainerMessage::ReportHostInfo => {
                self.report_host_info();
            }

            ContainerMessage::ProvisionFinished { app_id, succeeded } => {
                self.provision_finished(app_id, succeeded).await;
            }

            ContainerMessage::Snapshot { reply_to } => {
                let _ = reply_to.send(self.snapshot());
            }
        }

        Ok(true)
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        info!(actor_id = %ctx.actor_id, "ContainerSupervisor starting");
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        info!(
            actor_id = %ctx.actor_id,
            containers = self.containers.len(),
            apps = self.apps.len(),
            in_flight = self.in_flight.len(),
            "ContainerSupervisor stopping"
        );
    }
}

/// Ask the supervisor for its current state.
pub async fn snapshot(
    handle: &ActorHandle<ContainerMessage>,
) -> Result<StateSnapshot, ActorError> {
    let (reply_to, rx) = oneshot::channel();
    handle.send(ContainerMessage::Snapshot { reply_to }).await?;
    rx.await.map_err(|_| ActorError::ActorStopped)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryLog;
    use crate::client::{ControlPlaneCall, MockControlPlane};
    use crate::engine::{EngineCall, MockEngine};
    use crate::tasks::MemorySink;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        handle: ActorHandle<ContainerMessage>,
        engine: Arc<MockEngine>,
        control_plane: Arc<MockControlPlane>,
        errors: Arc<MemorySink>,
        _supervisor: Supervisor,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness(engine: MockEngine, apps: Vec<App>) -> Harness {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let engine = Arc::new(engine);
        let control_plane = Arc::new(MockControlPlane::new(apps));
        let errors = Arc::new(MemorySink::new());

        let handle = ContainerSupervisor::spawn(
            &mut supervisor,
            engine.clone(),
            control_plane.clone(),
            Arc::new(MemoryLog::new()),
            errors.clone(),
        );

        Harness {
            handle,
            engine,
            control_plane,
            errors,
            _supervisor: supervisor,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn app(id: &str) -> App {
        App {
            id: id.to_string(),
            image: "nginx:latest".to_string(),
            is_host_network: false,
            envs: vec![],
        }
    }

    async fn wait_until_settled(handle: &ActorHandle<ContainerMessage>) -> StateSnapshot {
        for _ in 0..100 {
            let state = snapshot(handle).await.unwrap();
            if state.in_flight.is_empty() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("provisioning did not settle");
    }

    #[tokio::test]
    async fn test_refresh_replaces_cache() {
        let h = harness(MockEngine::new(), vec![]);

        h.handle.send(ContainerMessage::RefreshActualState).await.unwrap();
        let state = snapshot(&h.handle).await.unwrap();

        assert_eq!(state.refresh_count, 1);
        assert!(state.containers.is_empty());
        assert_eq!(
            h.engine.count_calls(|c| matches!(c, EngineCall::ListContainers)),
            1
        );
    }

    #[tokio::test]
    async fn test_reload_apps_provisions_missing() {
        let h = harness(MockEngine::new(), vec![app("app1")]);

        h.handle.send(ContainerMessage::ReloadApps).await.unwrap();
        let state = wait_until_settled(&h.handle).await;

        assert_eq!(state.apps, vec![app("app1")]);
        assert_eq!(state.reconcile_count, 1);
        assert!(reconciler::find_app_container("app1", &state.containers).is_some());
        assert!(h.errors.errors().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_reconciles_create_once() {
        let h = harness(MockEngine::new(), vec![]);

        h.handle
            .send(ContainerMessage::Reconcile { apps: vec![app("app1")] })
            .await
            .unwrap();
        h.handle
            .send(ContainerMessage::Reconcile { apps: vec![app("app1")] })
            .await
            .unwrap();
        let state = wait_until_settled(&h.handle).await;

        h.handle
            .send(ContainerMessage::Reconcile { apps: vec![app("app1")] })
            .await
            .unwrap();
        let state_after = wait_until_settled(&h.handle).await;

        assert_eq!(state.reconcile_count, 2);
        assert_eq!(state_after.reconcile_count, 3);
        assert_eq!(
            h.engine.count_calls(|c| matches!(c, EngineCall::Create(_))),
            1
        );
        assert_eq!(state_after.containers.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_provision_is_retried_next_pass() {
        let h = harness(MockEngine::failing_pulls(), vec![]);

        h.handle
            .send(ContainerMessage::Reconcile { apps: vec![app("app1")] })
            .await
            .unwrap();
        let state = wait_until_settled(&h.handle).await;
        assert!(state.containers.is_empty());

        let errors = h.errors.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task, "provision_app");
        assert_eq!(errors[0].class, "engine");

        h.handle
            .send(ContainerMessage::Reconcile { apps: vec![app("app1")] })
            .await
            .unwrap();
        wait_until_settled(&h.handle).await;
        assert_eq!(
            h.engine.count_calls(|c| matches!(c, EngineCall::Pull(_))),
            2
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_desired_state() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let errors = Arc::new(MemorySink::new());
        let handle = ContainerSupervisor::spawn(
            &mut supervisor,
            Arc::new(MockEngine::new()),
            Arc::new(MockControlPlane::failing()),
            Arc::new(MemoryLog::new()),
            errors.clone(),
        );

        handle.send(ContainerMessage::ReloadApps).await.unwrap();
        let state = snapshot(&handle).await.unwrap();

        assert!(state.apps.is_empty());
        assert_eq!(state.reconcile_count, 0);
        assert_eq!(errors.errors()[0].task, "fetch_apps");
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn test_report_host_info_does_not_reconcile() {
        let h = harness(MockEngine::new(), vec![app("app1")]);

        h.handle.send(ContainerMessage::ReportHostInfo).await.unwrap();
        let state = snapshot(&h.handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(state.reconcile_count, 0);
        assert_eq!(
            h.control_plane
                .count_calls(|c| matches!(c, ControlPlaneCall::PushHostInfo(_))),
            1
        );
        assert_eq!(
            h.control_plane
                .count_calls(|c| matches!(c, ControlPlaneCall::FetchApps)),
            0
        );
    }
}
