//! Engine event monitor.
//!
//! Subscribes to the engine event stream for the lifetime of the process.
//! Container events trigger an actual-state refresh; every event is forwarded
//! as a log line. A dropped stream is resubscribed with backoff.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actors::{ActorHandle, BackoffPolicy, ContainerMessage};
use crate::bus::LogPublisher;
use crate::engine::{Engine, EngineEvent};
use crate::tasks::wait_for_shutdown;

/// Buffered events between the engine stream and the monitor.
const EVENT_BUFFER: usize = 64;

/// What to do with one engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventClass {
    /// Whether actual state must be refreshed.
    pub refresh: bool,

    /// Log line to publish.
    pub line: String,
}

/// Classify an engine event.
pub fn classify(event: &EngineEvent) -> EventClass {
    if event.kind == "container" {
        let attributes =
            serde_json::to_string(&event.attributes).unwrap_or_else(|_| "{}".to_string());
        EventClass {
            refresh: true,
            line: format!("{} {}: {}", event.kind, event.action, attributes),
        }
    } else {
        EventClass {
            refresh: false,
            line: format!("{} {}", event.kind, event.action),
        }
    }
}

/// Supervised consumer of the engine event stream.
pub struct EventMonitor {
    engine: Arc<dyn Engine>,
    supervisor: ActorHandle<ContainerMessage>,
    log: Arc<dyn LogPublisher>,
    backoff: BackoffPolicy,
}

impl EventMonitor {
    pub fn new(
        engine: Arc<dyn Engine>,
        supervisor: ActorHandle<ContainerMessage>,
        log: Arc<dyn LogPublisher>,
    ) -> Self {
        Self {
            engine,
            supervisor,
            log,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Override the resubscribe backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// React to one engine event.
    pub async fn handle_event(&self, event: EngineEvent) {
        let class = classify(&event);

        if class.refresh {
            if let Err(e) = self.supervisor.send(ContainerMessage::RefreshActualState).await {
                warn!(error = %e, "Failed to request refresh for engine event");
            }
        }

        self.log.publish_log(class.line).await;
    }

    /// Consume events until shutdown, resubscribing whenever the stream ends.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;

        loop {
            let delivered = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                delivered = self.subscribe_once() => delivered,
            };

            if delivered > 0 {
                failures = 0;
            }
            failures = failures.saturating_add(1);

            let delay = self.backoff.delay(failures);
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Resubscribing to engine events"
            );

            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Event monitor stopped");
    }

    /// Run one subscription to completion. Returns the number of events handled.
    async fn subscribe_once(&self) -> usize {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        debug!("Subscribing to engine events");

        let consume = async {
            let mut delivered = 0;
            while let Some(event) = rx.recv().await {
                self.handle_event(event).await;
                delivered += 1;
            }
            delivered
        };

        let (result, delivered) = tokio::join!(self.engine.stream_events(tx), consume);

        match result {
            Ok(()) => warn!(events = delivered, "Engine event stream ended"),
            Err(e) => warn!(events = delivered, error = %e, "Engine event stream failed"),
        }

        delivered
    }
}
