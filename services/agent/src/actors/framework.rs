//! Core actor framework types and traits.
//!
//! Provides the building blocks for single-owner state:
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for spawning and stopping actors
//! - `ActorHandle` for sending messages to actors
//! - `BackoffPolicy` for reconnect and resubscribe delays

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Messages handled so far.
    pub messages_processed: u64,
}

impl ActorContext {
    fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased actor reference for supervision.
struct ActorRef {
    actor_type: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = rand_jitter(delay * self.jitter);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Jitter in `[-range, range]` from a clock-seeded LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = seed.wrapping_mul(6364136223846793005).wrapping_add(1) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0;
    normalized * range
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owner of spawned actors; stops them together on shutdown.
pub struct Supervisor {
    children: HashMap<String, ActorRef>,

    /// Process-wide shutdown signal, forwarded to every child.
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Spawn and supervise an actor.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let name = actor.name().to_string();
        self.spawn_with(&name, mailbox_size, move |_| actor)
    }

    /// Spawn an actor that needs a handle to its own mailbox.
    ///
    /// `build` receives that handle and returns the actor to run.
    pub fn spawn_with<A, F>(
        &mut self,
        name: &str,
        mailbox_size: usize,
        build: F,
    ) -> ActorHandle<A::Message>
    where
        A: Actor,
        F: FnOnce(ActorHandle<A::Message>) -> A,
    {
        let actor_id = format!("{}_{}", name, generate_actor_id());
        let (tx, rx) = mpsc::channel(mailbox_size);
        let handle = ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        };

        let actor = build(handle.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(run_actor_loop(
            actor,
            rx,
            shutdown_rx,
            self.shutdown.clone(),
            actor_id.clone(),
        ));

        self.children.insert(
            actor_id.clone(),
            ActorRef {
                actor_type: name.to_string(),
                task_handle,
                shutdown_tx,
            },
        );

        info!(actor_id = %actor_id, actor_type = %name, "Spawned actor");

        handle
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, actor_type = %child.actor_type, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(actor_id = %actor_id, "Actor received stop signal");
                    break;
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
