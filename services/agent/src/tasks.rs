//! Reported background tasks.
//!
//! Fire-and-forget work (state pushes, engine commands, provisioning) runs as
//! a spawned task whose failure is captured as an `AgentError` and handed to a
//! single `ErrorSink`. Call sites never catch-and-log on their own.
//!
//! Long-lived loops stop through `wait_for_shutdown`.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Destination for failures of reported tasks.
pub trait ErrorSink: Send + Sync {
    /// Record the failure of the task labelled `task`.
    fn report(&self, task: &'static str, error: &AgentError);
}

/// Error sink that writes each failure as a `warn!` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, task: &'static str, error: &AgentError) {
        warn!(task, class = error.class(), error = %error, "Task failed");
    }
}

/// A failure captured by `MemorySink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub task: &'static str,
    pub class: &'static str,
    pub message: String,
}

/// Error sink that keeps failures in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    errors: Mutex<Vec<ReportedError>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All failures reported so far.
    pub fn errors(&self) -> Vec<ReportedError> {
        self.errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

impl ErrorSink for MemorySink {
    fn report(&self, task: &'static str, error: &AgentError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(ReportedError {
                task,
                class: error.class(),
                message: error.to_string(),
            });
        }
    }
}

/// Run `fut` to completion, reporting an error outcome to `sink`.
///
/// Returns whether the task succeeded.
pub async fn run_reported<F>(sink: &dyn ErrorSink, task: &'static str, fut: F) -> bool
where
    F: Future<Output = Result<(), AgentError>>,
{
    match fut.await {
        Ok(()) => {
            debug!(task, "Task completed");
            true
        }
        Err(e) => {
            sink.report(task, &e);
            false
        }
    }
}

/// Spawn `fut` as a detached task whose failure goes to `sink`.
pub fn spawn_reported<F>(sink: Arc<dyn ErrorSink>, task: &'static str, fut: F) -> JoinHandle<bool>
where
    F: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    tokio::spawn(async move { run_reported(sink.as_ref(), task, fut).await })
}

/// Resolve once `shutdown` is set, or once its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
