//! runlet: transparent RPC bridge between a manager process and a child
//! runner hosting a background service.
//!
//! The manager spawns the runner, obtains a call seam that behaves like a
//! local instance of the service, and receives its events and log records.
//! Calls travel as framed binary messages over a unix socket pair; the
//! runner dispatches them sequentially on the hosted service instance.

pub mod bridge;
mod events;
pub mod manager;
mod pending;
pub mod runner;
mod runner_log;
pub mod service;

pub use bridge::payload::{PayloadError, from_value, to_value};
pub use bridge::protocol::Severity;
pub use events::EventSubscription;
pub use manager::{
    CallError, CommandSpawner, ManagerConfig, RunnerSpawner, ServiceManager, SessionState,
    ShutdownError, SpawnContext, SpawnError, StartupError,
};
pub use runner::{RunnerArgs, RunnerError};
pub use service::{
    BridgedService, DispatchError, EmitError, EventEmitter, ServiceRegistry, ok_value,
    required_arg,
};

pub use rmpv::Value;
