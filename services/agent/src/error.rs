//! Error taxonomy for the agent.
//!
//! Every asynchronous boundary converts its failure into one of these classes
//! and hands it to the error sink (see `tasks`). Nothing here is retried.

use thiserror::Error;

/// Top-level agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bus disconnect, offline broker or a rejected publish.
    #[error("bus connectivity: {0}")]
    Connectivity(String),

    /// Control plane call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Container engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Inbound payload could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl AgentError {
    /// Short class name, used as a structured log field.
    pub fn class(&self) -> &'static str {
        match self {
            AgentError::Connectivity(_) => "connectivity",
            AgentError::Transport(_) => "transport",
            AgentError::Engine(_) => "engine",
            AgentError::Protocol(_) => "protocol",
        }
    }
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(err: rumqttc::ClientError) -> Self {
        AgentError::Connectivity(err.to_string())
    }
}

/// Control plane errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced a response (connect, timeout, decode).
    #[error("control plane request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The control plane answered with a non-success status.
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Container engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A container with the requested name already exists.
    #[error("container name already in use: {0}")]
    Conflict(String),

    /// The referenced container or image does not exist.
    #[error("no such object: {0}")]
    NotFound(String),

    /// Any other engine failure.
    #[error("engine error: {0}")]
    Api(String),
}

/// Inbound message decoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command payload is not valid JSON or has the wrong field types.
    #[error("malformed command payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Command payload is valid JSON but not an object.
    #[error("command payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}
