//! Fora Host Agent Library
//!
//! The agent runs on each host and keeps its containers in line with the apps
//! the control plane assigns to it. It reports containers and host info back
//! over REST and takes commands and notifications over MQTT.
//!
//! ## Architecture
//!
//! ```text
//! BusSession ──> CommandProcessor ──┐
//!                                   ├──> ContainerSupervisor ──> Provisioner
//! EventMonitor ─────────────────────┘           │
//!                                               ├──> Engine (Docker)
//!                                               └──> ControlPlane (REST)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the container supervisor
//! - `bus`: MQTT session, online flag and log publishing
//! - `client`: Control-plane REST client
//! - `engine`: Container engine gateway (Docker and in-memory)
//! - `monitor`: Engine event stream consumer

pub mod actors;
pub mod bus;
pub mod client;
pub mod commands;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod tasks;

// Internal modules exposed for integration tests
pub mod config;
pub mod provision;
pub mod reconciler;

// Re-export commonly used types
pub use actors::{ContainerMessage, ContainerSupervisor, StateSnapshot};
pub use client::{App, ControlPlane, HttpControlPlane, MockControlPlane};
pub use engine::{DockerEngine, Engine, MockEngine};
pub use error::AgentError;
