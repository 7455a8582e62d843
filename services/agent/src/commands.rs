//! Command processor for inbound bus messages.
//!
//! Command payloads are JSON `{containerId, action}` and map to a single
//! engine call. Notify payloads are bare tokens that trigger a refresh,
//! a host-info report or an app reload through the container supervisor.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actors::{ActorHandle, ContainerMessage};
use crate::bus::{Channel, InboundMessage};
use crate::engine::Engine;
use crate::error::{AgentError, ProtocolError};
use crate::tasks::{spawn_reported, ErrorSink};

/// A decoded command payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Command {
    #[serde(rename = "containerId", default)]
    pub container_id: Option<String>,

    #[serde(default)]
    pub action: Option<String>,
}

impl Command {
    /// Decode a command payload. Only a JSON object is a command.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match serde_json::from_slice(payload)? {
            value @ Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(ProtocolError::NotAnObject(json_kind(&other))),
        }
    }

    /// The engine call this command asks for, if it names one.
    pub fn action(&self) -> Option<CommandAction> {
        self.action.as_deref().and_then(CommandAction::parse)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Engine operation requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Start,
    Stop,
    Remove,
}

impl CommandAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }

    fn task_name(self) -> &'static str {
        match self {
            Self::Start => "start_container",
            Self::Stop => "stop_container",
            Self::Remove => "remove_container",
        }
    }
}

/// Notification tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    ReloadContainers,
    ReloadInfo,
    ReloadApps,
}

impl NotifyEvent {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "reloadContainers" => Some(Self::ReloadContainers),
            "reloadInfo" => Some(Self::ReloadInfo),
            "reloadApps" => Some(Self::ReloadApps),
            _ => None,
        }
    }

    /// Supervisor message this notification triggers.
    pub fn message(self) -> ContainerMessage {
        match self {
            Self::ReloadContainers => ContainerMessage::RefreshActualState,
            Self::ReloadInfo => ContainerMessage::ReportHostInfo,
            Self::ReloadApps => ContainerMessage::ReloadApps,
        }
    }
}

/// Dispatches inbound command and notify messages.
pub struct CommandProcessor {
    engine: Arc<dyn Engine>,
    supervisor: ActorHandle<ContainerMessage>,
    errors: Arc<dyn ErrorSink>,
}

impl CommandProcessor {
    pub fn new(
        engine: Arc<dyn Engine>,
        supervisor: ActorHandle<ContainerMessage>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            engine,
            supervisor,
            errors,
        }
    }

    /// Handle inbound messages until the channel closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!("Command processor started");

        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle(message).await {
                self.errors.report("handle_command", &e);
            }
        }

        info!("Command processor stopped");
    }

    /// Handle one inbound message.
    ///
    /// Engine calls are spawned and reported; they are not awaited here.
    pub async fn handle(&self, message: InboundMessage) -> Result<(), AgentError> {
        match message.channel {
            Channel::Command => {
                let command = Command::decode(&message.payload)?;
                self.dispatch_command(&command);
            }
            Channel::Notify => {
                let token = String::from_utf8_lossy(&message.payload);
                self.dispatch_notify(&token).await;
            }
        }
        Ok(())
    }

    fn dispatch_command(&self, command: &Command) {
        let (Some(container_id), Some(action)) = (command.container_id.clone(), command.action())
        else {
            debug!(?command, "Ignoring command without container id or known action");
            return;
        };

        info!(container_id = %container_id, ?action, "Executing container command");

        let engine = Arc::clone(&self.engine);
        spawn_reported(Arc::clone(&self.errors), action.task_name(), async move {
            match action {
                CommandAction::Start => engine.start_container(&container_id).await?,
                CommandAction::Stop => engine.stop_container(&container_id).await?,
                CommandAction::Remove => engine.remove_container(&container_id).await?,
            }
            Ok(())
        });
    }

    async fn dispatch_notify(&self, token: &str) {
        let Some(event) = NotifyEvent::parse(token) else {
            debug!(token = %token, "Ignoring unknown notification");
            return;
        };

        info!(?event, "Notification received");
        if let Err(e) = self.supervisor.send(event.message()).await {
            warn!(?event, error = %e, "Failed to forward notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{snapshot, ContainerSupervisor, Supervisor};
    use crate::bus::MemoryLog;
    use crate::client::{ControlPlaneCall, MockControlPlane};
    use crate::engine::{Container, EngineCall, MockEngine};
    use crate::tasks::MemorySink;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        processor: CommandProcessor,
        engine: Arc<MockEngine>,
        control_plane: Arc<MockControlPlane>,
        supervisor_handle: ActorHandle<ContainerMessage>,
        errors: Arc<MemorySink>,
        _supervisor: Supervisor,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let engine = Arc::new(MockEngine::new().with_containers(vec![Container {
            id: "c1".to_string(),
            names: vec!["/app1".to_string()],
            image: "nginx:latest".to_string(),
            status: "Up".to_string(),
        }]));
        let control_plane = Arc::new(MockControlPlane::new(vec![]));
        let errors = Arc::new(MemorySink::new());

        let supervisor_handle = ContainerSupervisor::spawn(
            &mut supervisor,
            engine.clone(),
            control_plane.clone(),
            Arc::new(MemoryLog::new()),
            errors.clone(),
        );
        let processor =
            CommandProcessor::new(engine.clone(), supervisor_handle.clone(), errors.clone());

        Harness {
            processor,
            engine,
            control_plane,
            supervisor_handle,
            errors,
            _supervisor: supervisor,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn command(payload: &str) -> InboundMessage {
        InboundMessage {
            channel: Channel::Command,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn notify(token: &str) -> InboundMessage {
        InboundMessage {
            channel: Channel::Notify,
            payload: token.as_bytes().to_vec(),
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_decode_command() {
        let cmd = Command::decode(br#"{"containerId":"c1","action":"stop"}"#).unwrap();
        assert_eq!(cmd.container_id.as_deref(), Some("c1"));
        assert_eq!(cmd.action(), Some(CommandAction::Stop));

        let empty = Command::decode(b"{}").unwrap();
        assert_eq!(empty, Command::default());
    }

    #[test]
    fn test_decode_malformed_command() {
        assert!(Command::decode(b"{containerId").is_err());
        assert!(Command::decode(b"stop").is_err());
    }

    #[rstest]
    #[case(r#"["c1","stop"]"#)]
    #[case(r#""stop""#)]
    #[case("42")]
    #[case("null")]
    fn test_decode_rejects_non_object(#[case] payload: &str) {
        assert!(matches!(
            Command::decode(payload.as_bytes()),
            Err(ProtocolError::NotAnObject(_))
        ));
    }

    #[rstest]
    #[case("reloadContainers", Some(NotifyEvent::ReloadContainers))]
    #[case("reloadInfo", Some(NotifyEvent::ReloadInfo))]
    #[case("reloadApps", Some(NotifyEvent::ReloadApps))]
    #[case("reloadApps\n", None)]
    #[case("reloadapps", None)]
    #[case("reboot", None)]
    #[case("", None)]
    fn test_parse_notify(#[case] token: &str, #[case] expected: Option<NotifyEvent>) {
        assert_eq!(NotifyEvent::parse(token), expected);
    }

    #[rstest]
    #[case("start", EngineCall::Start("c1".to_string()))]
    #[case("stop", EngineCall::Stop("c1".to_string()))]
    #[case("remove", EngineCall::Remove("c1".to_string()))]
    #[tokio::test]
    async fn test_command_dispatch(#[case] action: &str, #[case] expected: EngineCall) {
        let h = harness();
        let payload = format!(r#"{{"containerId":"c1","action":"{action}"}}"#);

        h.processor.handle(command(&payload)).await.unwrap();
        settle().await;

        let lifecycle: Vec<EngineCall> = h
            .engine
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    EngineCall::Start(_) | EngineCall::Stop(_) | EngineCall::Remove(_)
                )
            })
            .collect();
        assert_eq!(lifecycle, vec![expected]);
        assert!(h.errors.errors().is_empty());
    }

    #[rstest]
    #[case(r#"{"containerId":"c1","action":"restart"}"#)]
    #[case(r#"{"containerId":"c1"}"#)]
    #[case(r#"{"action":"stop"}"#)]
    #[tokio::test]
    async fn test_incomplete_command_calls_nothing(#[case] payload: &str) {
        let h = harness();

        h.processor.handle(command(payload)).await.unwrap();
        settle().await;

        assert!(h.engine.calls().is_empty());
        assert!(h.errors.errors().is_empty());
    }

    #[tokio::test]
    async fn test_array_command_calls_nothing() {
        let h = harness();

        let result = h.processor.handle(command(r#"["c1","stop"]"#)).await;
        settle().await;

        assert!(matches!(result, Err(AgentError::Protocol(_))));
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_engine_call_is_reported() {
        let h = harness();

        h.processor
            .handle(command(r#"{"containerId":"missing","action":"start"}"#))
            .await
            .unwrap();
        settle().await;

        let errors = h.errors.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task, "start_container");
        assert_eq!(errors[0].class, "engine");
    }

    #[tokio::test]
    async fn test_malformed_command_does_not_stop_processing() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);

        tx.send(command("not json")).await.unwrap();
        tx.send(command(r#"{"containerId":"c1","action":"stop"}"#))
            .await
            .unwrap();
        drop(tx);

        let errors = h.errors.clone();
        let engine = h.engine.clone();
        h.processor.run(rx).await;
        settle().await;

        let reported = errors.errors();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].task, "handle_command");
        assert_eq!(reported[0].class, "protocol");
        assert_eq!(
            engine.count_calls(|c| matches!(c, EngineCall::Stop(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_notify_reload_info_reports_without_reconcile() {
        let h = harness();

        h.processor.handle(notify("reloadInfo")).await.unwrap();
        let state = snapshot(&h.supervisor_handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(state.reconcile_count, 0);
        assert_eq!(
            h.control_plane
                .count_calls(|c| matches!(c, ControlPlaneCall::PushHostInfo(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_notify_reload_containers_refreshes() {
        let h = harness();

        h.processor.handle(notify("reloadContainers")).await.unwrap();
        let state = snapshot(&h.supervisor_handle).await.unwrap();

        assert_eq!(state.refresh_count, 1);
        assert_eq!(state.containers.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_notify_is_ignored() {
        let h = harness();

        h.processor.handle(notify("reboot")).await.unwrap();
        let state = snapshot(&h.supervisor_handle).await.unwrap();

        assert_eq!(state.refresh_count, 0);
        assert_eq!(state.reconcile_count, 0);
        assert!(h.control_plane.calls().is_empty());
    }
}
