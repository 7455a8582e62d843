//! Actor-based state ownership for the agent.
//!
//! All mutable agent state lives inside one actor so that refreshes and
//! reconciliations never race each other.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//!   └── ContainerSupervisor (actual + desired state, in-flight set)
//!         ├── provisioning tasks ──> ProvisionFinished
//!         └── reported push tasks ──> ErrorSink
//! ```
//!
//! ## Message Flow
//!
//! 1. Startup, the command processor and the event monitor send messages
//! 2. The ContainerSupervisor handles them one at a time
//! 3. Slow work (pulls, pushes) runs on spawned tasks and reports back

mod containers;
mod framework;

pub use containers::{snapshot, ContainerMessage, ContainerSupervisor, StateSnapshot};
pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Message, Supervisor,
};
