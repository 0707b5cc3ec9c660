//! Service-side binding seam.
//!
//! The runner hosts exactly one [`BridgedService`] instance per process,
//! created at startup from a [`ServiceRegistry`] factory and alive until
//! process exit. Method lookup is the service's own `dispatch` match;
//! outbound events flow through the [`EventEmitter`] handed over before
//! `start` runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rmpv::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::bridge::payload::{self, PayloadError};
use crate::bridge::protocol::Frame;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The call named a method the service does not expose.
    #[error("Method {0} not found")]
    MethodNotFound(String),

    /// The method body failed; the message is the root cause.
    #[error("{0}")]
    Invocation(String),

    /// An argument did not decode into the declared parameter type.
    #[error("argument {index} did not match the declared type: {source}")]
    InvalidArgument { index: usize, source: PayloadError },

    /// The call carried fewer arguments than the method declares.
    #[error("argument {index} is missing")]
    MissingArgument { index: usize },
}

impl DispatchError {
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation(message.into())
    }
}

/// Decode the positional argument at `index` into the declared type.
pub fn required_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, DispatchError> {
    let value = args
        .get(index)
        .ok_or(DispatchError::MissingArgument { index })?;
    payload::from_value(value.clone())
        .map_err(|source| DispatchError::InvalidArgument { index, source })
}

/// Wrap a method's return value for the dispatch table.
pub fn ok_value<T: Serialize>(value: T) -> Result<Option<Value>, DispatchError> {
    payload::to_value(value)
        .map(Some)
        .map_err(|e| DispatchError::Invocation(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("event payload failed to encode: {0}")]
    Encode(#[from] PayloadError),
    #[error("response stream closed")]
    Closed,
}

/// Outbound event channel handed to the service at startup.
///
/// Emitted frames are queued and written to the response stream under the
/// same write lock as Response frames, preserving emission order.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Frame>,
}

impl EventEmitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Serialize the payload and queue an Event frame.
    pub fn emit<T: Serialize>(&self, event: &str, payload: T) -> Result<(), EmitError> {
        let value = payload::to_value(payload)?;
        self.tx
            .send(Frame::Event {
                name: event.to_string(),
                payload: Some(value),
            })
            .map_err(|_| EmitError::Closed)
    }
}

/// The user-supplied background service hosted by the runner.
///
/// `dispatch` is the method lookup: match on the method name, decode
/// arguments positionally with [`required_arg`], and return the result
/// through [`ok_value`] (or `Ok(None)` for methods without a return value).
/// Unknown names must map to [`DispatchError::MethodNotFound`].
#[async_trait]
pub trait BridgedService: Send + Sync + 'static {
    /// Invoked fire-and-forget when the runner starts serving; the
    /// dispatch loop does not wait for it.
    async fn start(&self) {}

    /// Invoked when the manager stops the session, before the runner exits.
    async fn stop(&self) {}

    /// Receives the outbound event channel before `start` runs.
    fn attach_events(&self, _events: EventEmitter) {}

    /// Locate and invoke the named method with positional arguments.
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, DispatchError>;
}

type Factory = Box<dyn Fn() -> Arc<dyn BridgedService> + Send + Sync>;

/// Factory table mapping service identifiers to constructors.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, Factory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&mut self, id: &str, factory: F)
    where
        S: BridgedService,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories.insert(
            id.to_string(),
            Box::new(move || Arc::new(factory()) as Arc<dyn BridgedService>),
        );
    }

    pub fn create(&self, id: &str) -> Option<Arc<dyn BridgedService>> {
        self.factories.get(id).map(|factory| factory())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}
