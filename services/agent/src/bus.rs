//! Message bus session.
//!
//! The bus session owns the MQTT connection to the broker:
//! - Registers a retained `false` last will on the online topic
//! - Publishes a retained `true` and subscribes to command/notify on connect
//! - Tracks connectivity and drops log lines while not connected
//! - Delivers inbound command/notify payloads to the command processor
//!
//! ## Connection states
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected ──> Offline ──> Reconnecting ──> Connected
//!                                     │
//!                                     └──> Disconnected
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actors::BackoffPolicy;
use crate::config::Config;
use crate::error::AgentError;
use crate::tasks::{spawn_reported, wait_for_shutdown, ErrorSink};

/// Default MQTT port when the bus URL has none.
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Capacity of the client request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Topics
// =============================================================================

/// Topic names rooted at the agent id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub online: String,
    pub log: String,
    pub command: String,
    pub notify: String,
}

impl Topics {
    pub fn new(agent_id: &str) -> Self {
        Self {
            online: format!("agents/{agent_id}/online"),
            log: format!("agents/{agent_id}/log"),
            command: format!("agents/{agent_id}/command"),
            notify: format!("agents/{agent_id}/notify"),
        }
    }

    /// Map an inbound topic to its logical channel.
    pub fn channel_for(&self, topic: &str) -> Option<Channel> {
        if topic == self.command {
            Some(Channel::Command)
        } else if topic == self.notify {
            Some(Channel::Notify)
        } else {
            None
        }
    }

    /// Wrap a publish on `topic` as an inbound message, if it is ours.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Option<InboundMessage> {
        self.channel_for(topic).map(|channel| InboundMessage {
            channel,
            payload: payload.to_vec(),
        })
    }
}

/// Logical inbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Notify,
}

/// A message received on one of the subscribed channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

// =============================================================================
// Connection State
// =============================================================================

/// Bus connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected; log lines are published.
    Connected,
    /// Retrying after a connection loss.
    Reconnecting,
    /// Connection lost.
    Offline,
}

/// Connection-level signals observed by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSignal {
    /// Event loop is about to poll for the first time.
    Start,
    /// Broker accepted the connection.
    ConnAck,
    /// The transport failed.
    ConnectionLost,
    /// Backoff elapsed; polling again.
    Retry,
    /// Disconnect packet sent or received.
    Disconnect,
}

impl ConnectionState {
    /// State after observing `signal`.
    pub fn next(self, signal: BusSignal) -> ConnectionState {
        match (self, signal) {
            (_, BusSignal::ConnAck) => ConnectionState::Connected,
            (_, BusSignal::Disconnect) => ConnectionState::Disconnected,
            (_, BusSignal::ConnectionLost) => ConnectionState::Offline,
            (ConnectionState::Offline, BusSignal::Retry) => ConnectionState::Reconnecting,
            (ConnectionState::Disconnected, BusSignal::Start) => ConnectionState::Connecting,
            (state, _) => state,
        }
    }

    /// Whether log lines may be published in this state.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

// =============================================================================
// Log Publishing
// =============================================================================

/// Sink for agent log lines sent to the control plane.
#[async_trait]
pub trait LogPublisher: Send + Sync {
    /// Publish one log line. Lines are dropped when the bus is down.
    async fn publish_log(&self, line: String);
}

/// Log publisher that records lines in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines published so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogPublisher for MemoryLog {
    async fn publish_log(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

// =============================================================================
// Bus Session
// =============================================================================

/// Build the MQTT connection options for this agent.
pub fn mqtt_options(config: &Config) -> Result<MqttOptions, AgentError> {
    let url = reqwest::Url::parse(&config.mqtt_url)
        .map_err(|e| AgentError::Connectivity(format!("invalid bus url: {e}")))?;

    match url.scheme() {
        "mqtt" | "tcp" => {}
        other => {
            return Err(AgentError::Connectivity(format!(
                "unsupported bus url scheme: {other}"
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AgentError::Connectivity("bus url has no host".to_string()))?;
    let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);
    let topics = Topics::new(&config.agent_id);

    let mut options = MqttOptions::new(config.agent_id.clone(), host, port);
    options
        .set_credentials(config.agent_id.clone(), config.agent_token.clone())
        .set_keep_alive(Duration::from_secs(30))
        .set_last_will(LastWill::new(
            topics.online,
            "false",
            QoS::AtLeastOnce,
            true,
        ));

    Ok(options)
}

/// Handle to the bus connection, shared by every component that logs.
pub struct BusSession {
    client: AsyncClient,
    topics: Topics,
    state: watch::Receiver<ConnectionState>,
    errors: Arc<dyn ErrorSink>,
}

/// Drives the MQTT event loop; run it on its own task.
pub struct BusEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    state: watch::Sender<ConnectionState>,
    backoff: BackoffPolicy,
    errors: Arc<dyn ErrorSink>,
}

impl BusSession {
    /// Create the session and its event loop. No I/O happens until the event
    /// loop runs.
    pub fn connect(
        config: &Config,
        errors: Arc<dyn ErrorSink>,
    ) -> Result<(Self, BusEventLoop), AgentError> {
        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let topics = Topics::new(&config.agent_id);

        info!(url = %config.mqtt_url, agent_id = %config.agent_id, "Bus session created");

        let session = Self {
            client: client.clone(),
            topics: topics.clone(),
            state: state_rx,
            errors: Arc::clone(&errors),
        };
        let event_loop = BusEventLoop {
            eventloop,
            client,
            topics,
            state: state_tx,
            backoff: BackoffPolicy::default(),
            errors,
        };

        Ok((session, event_loop))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl LogPublisher for BusSession {
    async fn publish_log(&self, line: String) {
        if !self.state().is_connected() {
            info!(line = %line, "Not connected, dropping log line");
            return;
        }

        info!(line = %line, "Agent log");
        if let Err(e) = self
            .client
            .publish(self.topics.log.as_str(), QoS::AtMostOnce, false, line)
            .await
        {
            self.errors.report("publish_log", &e.into());
        }
    }
}

impl BusEventLoop {
    /// Override the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll the connection until shutdown, forwarding inbound messages.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.signal(BusSignal::Start);
        let mut consecutive_failures = 0u32;

        loop {
            let event = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    consecutive_failures = 0;
                    self.signal(BusSignal::ConnAck);

                    let client = self.client.clone();
                    let topics = self.topics.clone();
                    spawn_reported(Arc::clone(&self.errors), "announce_online", async move {
                        announce_online(&client, &topics).await
                    });
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match self.topics.route(&publish.topic, &publish.payload) {
                        Some(message) => {
                            if inbound.send(message).await.is_err() {
                                warn!("Inbound receiver dropped, stopping bus event loop");
                                break;
                            }
                        }
                        None => {
                            debug!(topic = %publish.topic, "Ignoring message on unknown topic")
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect))
                | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.signal(BusSignal::Disconnect);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Bus connection error");
                    self.signal(BusSignal::ConnectionLost);

                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.backoff.delay(consecutive_failures);
                    info!(
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling bus reconnect"
                    );

                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.signal(BusSignal::Retry);
                }
            }
        }

        info!("Bus event loop stopped");
    }

    fn signal(&self, signal: BusSignal) {
        let current = *self.state.borrow();
        let next = current.next(signal);
        if next == current {
            return;
        }

        match next {
            ConnectionState::Connected => info!("MQTT connected"),
            ConnectionState::Connecting => info!("MQTT connecting"),
            ConnectionState::Reconnecting => info!("MQTT reconnect attempt"),
            ConnectionState::Offline => warn!("MQTT is offline"),
            ConnectionState::Disconnected => warn!("MQTT disconnected"),
        }
        self.state.send_replace(next);
    }
}

/// Announce a fresh connection: log line, retained online flag, command and
/// notify subscriptions, then the subscription log line.
pub async fn announce_online(client: &AsyncClient, topics: &Topics) -> Result<(), AgentError> {
    client
        .publish(topics.log.as_str(), QoS::AtMostOnce, false, "MQTT is connected")
        .await?;
    client
        .publish(topics.online.as_str(), QoS::AtLeastOnce, true, "true")
        .await?;
    client
        .subscribe(topics.command.as_str(), QoS::AtLeastOnce)
        .await?;
    client
        .subscribe(topics.notify.as_str(), QoS::AtLeastOnce)
        .await?;
    client
        .publish(
            topics.log.as_str(),
            QoS::AtMostOnce,
            false,
            format!("Subscribed to command topic: {}", topics.command),
        )
        .await?;
    Ok(())
}
