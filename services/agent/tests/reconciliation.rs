//! Integration tests for the reconciliation flow.
//!
//! These tests verify the full flow from desired apps to running containers:
//! 1. ContainerSupervisor fetches desired apps
//! 2. Provisioner mints an access key and pulls the image
//! 3. The engine creates and starts the container, and the cache is refreshed
//!
//! Uses MockEngine and MockControlPlane to simulate Docker and the API.

use std::sync::Arc;
use std::time::Duration;

use fora_agent::actors::{
    snapshot, ActorHandle, ContainerMessage, ContainerSupervisor, StateSnapshot, Supervisor,
};
use fora_agent::bus::MemoryLog;
use fora_agent::client::{App, ControlPlaneCall, MockControlPlane};
use fora_agent::engine::{ContainerSpec, EngineCall, MockEngine};
use fora_agent::error::{AgentError, EngineError};
use fora_agent::provision::Provisioner;
use fora_agent::reconciler::find_app_container;
use fora_agent::tasks::MemorySink;
use tokio::sync::watch;

fn test_app(id: &str, image: &str) -> App {
    App {
        id: id.to_string(),
        image: image.to_string(),
        is_host_network: false,
        envs: vec!["PORT=8080".to_string()],
    }
}

struct Agent {
    handle: ActorHandle<ContainerMessage>,
    engine: Arc<MockEngine>,
    control_plane: Arc<MockControlPlane>,
    log: Arc<MemoryLog>,
    errors: Arc<MemorySink>,
    supervisor: Supervisor,
    shutdown_tx: watch::Sender<bool>,
}

fn start_agent(engine: MockEngine, apps: Vec<App>) -> Agent {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(shutdown_rx);
    let engine = Arc::new(engine);
    let control_plane = Arc::new(MockControlPlane::new(apps));
    let log = Arc::new(MemoryLog::new());
    let errors = Arc::new(MemorySink::new());

    let handle = ContainerSupervisor::spawn(
        &mut supervisor,
        engine.clone(),
        control_plane.clone(),
        log.clone(),
        errors.clone(),
    );

    Agent {
        handle,
        engine,
        control_plane,
        log,
        errors,
        supervisor,
        shutdown_tx,
    }
}

async fn settled(handle: &ActorHandle<ContainerMessage>) -> StateSnapshot {
    for _ in 0..200 {
        let state = snapshot(handle).await.unwrap();
        if state.in_flight.is_empty() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provisioning did not settle");
}

#[tokio::test]
async fn test_single_app_is_provisioned() {
    let agent = start_agent(MockEngine::new(), vec![test_app("app1", "nginx:latest")]);

    agent.handle.send(ContainerMessage::RefreshActualState).await.unwrap();
    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    let state = settled(&agent.handle).await;

    // One mint for the app
    assert_eq!(
        agent
            .control_plane
            .count_calls(|c| *c == ControlPlaneCall::MintAccessKey("app1".to_string())),
        1
    );

    // One pull of the image
    let pulls: Vec<EngineCall> = agent
        .engine
        .calls()
        .into_iter()
        .filter(|c| matches!(c, EngineCall::Pull(_)))
        .collect();
    assert_eq!(pulls, vec![EngineCall::Pull("nginx:latest".to_string())]);

    // One create with the identity envs first
    let creates: Vec<ContainerSpec> = agent
        .engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            EngineCall::Create(spec) => Some(spec),
            _ => None,
        })
        .collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].name, "app1");
    assert_eq!(
        creates[0].env,
        vec!["FORA_APP_ID=app1", "FORA_APP_TOKEN=token-app1", "PORT=8080"]
    );

    // Cache reflects the new container
    assert!(find_app_container("app1", &state.containers).is_some());
    assert!(agent.errors.errors().is_empty());

    // Pull progress was forwarded as log lines
    assert!(agent.log.lines().iter().any(|l| l == "Pull complete:layer0"));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let agent = start_agent(MockEngine::new(), vec![test_app("app1", "nginx:latest")]);

    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    settled(&agent.handle).await;

    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    let state = settled(&agent.handle).await;

    assert_eq!(state.reconcile_count, 3);
    assert_eq!(
        agent.engine.count_calls(|c| matches!(c, EngineCall::Create(_))),
        1
    );
    assert_eq!(state.containers.len(), 1);
}

#[tokio::test]
async fn test_existing_container_is_left_alone() {
    let engine = MockEngine::new();
    let agent = start_agent(engine, vec![test_app("app1", "nginx:latest")]);

    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    settled(&agent.handle).await;

    // Desired image changes; the present container is not replaced
    agent.control_plane.set_apps(vec![test_app("app1", "nginx:1.27")]);
    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    let state = settled(&agent.handle).await;

    assert_eq!(state.apps[0].image, "nginx:1.27");
    assert_eq!(
        agent.engine.count_calls(|c| matches!(c, EngineCall::Pull(_))),
        1
    );
}

#[tokio::test]
async fn test_apps_provision_independently() {
    let agent = start_agent(
        MockEngine::new(),
        vec![
            test_app("app1", "nginx:latest"),
            test_app("app2", "redis:7"),
            test_app("app3", "ghcr.io/fora/worker@sha256:abc"),
        ],
    );

    agent.handle.send(ContainerMessage::ReloadApps).await.unwrap();
    let state = settled(&agent.handle).await;

    for id in ["app1", "app2", "app3"] {
        assert!(
            find_app_container(id, &state.containers).is_some(),
            "{id} missing"
        );
    }
    assert_eq!(
        agent
            .control_plane
            .count_calls(|c| matches!(c, ControlPlaneCall::MintAccessKey(_))),
        3
    );
}

#[tokio::test]
async fn test_concurrent_creates_hit_name_conflict() {
    let agent = start_agent(MockEngine::new(), vec![]);
    let provisioner = Provisioner::new(
        agent.engine.clone(),
        agent.control_plane.clone(),
        agent.log.clone(),
    );
    let spec = ContainerSpec {
        image: "nginx:latest".to_string(),
        name: "app1".to_string(),
        env: vec!["FORA_APP_ID=app1".to_string()],
        host_network: false,
    };

    let (first, second) = tokio::join!(
        provisioner.create_app_container(&spec),
        provisioner.create_app_container(&spec),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AgentError::Engine(EngineError::Conflict(_)))))
            .count(),
        1
    );

    // Once both settle, the supervisor's cache holds a single /app1
    agent
        .handle
        .send(ContainerMessage::RefreshActualState)
        .await
        .unwrap();
    let state = snapshot(&agent.handle).await.unwrap();
    let named: Vec<_> = state
        .containers
        .iter()
        .filter(|c| c.has_name("/app1"))
        .collect();
    assert_eq!(named.len(), 1);
    assert_eq!(state.containers.len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_supervisor() {
    let mut agent = start_agent(MockEngine::new(), vec![]);
    assert_eq!(agent.supervisor.running_count(), 1);

    agent.shutdown_tx.send(true).unwrap();
    agent.supervisor.stop_all().await;

    assert_eq!(agent.supervisor.running_count(), 0);
    assert!(snapshot(&agent.handle).await.is_err());
}
