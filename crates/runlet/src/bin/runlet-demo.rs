//! Demo runner executable.
//!
//! Hosts the sample service exercised by the integration tests: arithmetic,
//! echo with an `on_message` event, a failing method and a hard exit.

use std::sync::Mutex;

use async_trait::async_trait;
use clap::Parser;
use rmpv::Value;
use runlet::{
    BridgedService, DispatchError, EventEmitter, RunnerArgs, ServiceRegistry, ok_value,
    required_arg,
};

struct DemoService {
    events: Mutex<Option<EventEmitter>>,
}

impl DemoService {
    fn new() -> Self {
        Self {
            events: Mutex::new(None),
        }
    }

    fn emit_message(&self, message: &str) {
        let guard = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(events) = guard.as_ref()
            && let Err(e) = events.emit("on_message", message)
        {
            tracing::warn!(error = %e, "Failed to emit on_message");
        }
    }
}

#[async_trait]
impl BridgedService for DemoService {
    async fn start(&self) {
        tracing::info!("demo service started");
    }

    async fn stop(&self) {
        tracing::info!("demo service stopping");
    }

    fn attach_events(&self, events: EventEmitter) {
        *self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(events);
    }

    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, DispatchError> {
        match method {
            "add" => {
                let a: i64 = required_arg(&args, 0)?;
                let b: i64 = required_arg(&args, 1)?;
                ok_value(a + b)
            }
            "echo" => {
                let input: String = required_arg(&args, 0)?;
                let message = format!("Echoed: {input}");
                self.emit_message(&message);
                ok_value(message)
            }
            "touch" => Ok(None),
            "throw_exception" => Err(DispatchError::invocation("Test exception")),
            "hard_exit" => std::process::exit(1),
            _ => Err(DispatchError::MethodNotFound(method.to_string())),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = RunnerArgs::parse();

    let mut registry = ServiceRegistry::new();
    registry.register("demo.DemoService", DemoService::new);

    if let Err(e) = runlet::runner::run(args, &registry).await {
        eprintln!("runner failed: {e}");
        std::process::exit(1);
    }
}
