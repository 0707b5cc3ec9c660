//! Runner core - runs inside the child process.
//!
//! Connects to the session endpoints named on the command line, hosts the
//! single service instance, and serves Call frames sequentially (one
//! in-flight call at a time, so the service never needs to be re-entrant).
//! Events and log records funnel through one channel into a forwarder task
//! that shares the response-stream write lock with Response frames.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use rmpv::Value;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{self, CallOutcome, Frame, Severity};
use crate::bridge::transport::{self, EndpointNames};
use crate::runner_log::RunnerLogLayer;
use crate::service::{BridgedService, EventEmitter, ServiceRegistry};

/// Command-line surface of runner mode.
#[derive(Debug, Parser)]
pub struct RunnerArgs {
    /// Identifier of the service to host.
    #[arg(long)]
    pub process: String,

    /// Endpoint the manager writes Call frames to.
    #[arg(long)]
    pub command_pipe: PathBuf,

    /// Endpoint the runner writes Response, Event and Log frames to.
    #[arg(long)]
    pub response_pipe: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("failed to connect to session endpoints: {0}")]
    Connect(std::io::Error),
}

type ResponseWriter = Arc<tokio::sync::Mutex<FramedWrite<UnixStream, FrameCodec>>>;

/// Host the named service and serve calls until the manager stops the
/// session or the command stream closes.
///
/// Returns `Ok(())` on a graceful stop (the caller exits 0); an `Err` means
/// initialization failed and the caller should exit 1.
pub async fn run(args: RunnerArgs, registry: &ServiceRegistry) -> Result<(), RunnerError> {
    let service = registry
        .create(&args.process)
        .ok_or_else(|| RunnerError::UnknownService(args.process.clone()))?;

    let names = EndpointNames {
        command: args.command_pipe.clone(),
        response: args.response_pipe.clone(),
    };
    let (command, response) = transport::connect(&names)
        .await
        .map_err(RunnerError::Connect)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    init_tracing(out_tx.clone());
    install_panic_hook(out_tx.clone());

    let mut reader = FramedRead::new(command, FrameCodec::new());
    let writer: ResponseWriter =
        Arc::new(tokio::sync::Mutex::new(FramedWrite::new(response, FrameCodec::new())));

    let forwarder = tokio::spawn(forward_outbound(out_rx, Arc::clone(&writer)));

    service.attach_events(EventEmitter::new(out_tx.clone()));

    // StartAsync is fire-and-forget; the dispatch loop does not wait for it.
    let starting = Arc::clone(&service);
    tokio::spawn(async move {
        starting.start().await;
    });

    tracing::info!(service = %args.process, "Runner serving");

    while let Some(item) = reader.next().await {
        match item {
            Ok(Frame::Call { id, method, args }) => {
                let stopping = method == protocol::STOP_METHOD;
                let outcome = dispatch_call(&service, &method, args).await;

                let mut w = writer.lock().await;
                if let Err(e) = w.send(Frame::Response { id, outcome }).await {
                    tracing::error!(error = %e, "Failed to write response");
                    break;
                }
                drop(w);

                if stopping {
                    tracing::info!("Stop requested, runner exiting");
                    break;
                }
            }
            Ok(other) => {
                tracing::warn!(?other, "Ignoring unexpected frame on command stream");
            }
            Err(e) => {
                tracing::error!(error = %e, "Command stream error");
                break;
            }
        }
    }
    // A closed command stream means the manager went away; exit cleanly
    // either way.

    forwarder.abort();
    Ok(())
}

/// Resolve and invoke one call. Lifecycle names route to the trait's
/// start/stop hooks; everything else goes through the dispatch table.
async fn dispatch_call(
    service: &Arc<dyn BridgedService>,
    method: &str,
    args: Vec<Value>,
) -> CallOutcome {
    let result = match method {
        protocol::START_METHOD => {
            service.start().await;
            Ok(None)
        }
        protocol::STOP_METHOD => {
            service.stop().await;
            Ok(None)
        }
        _ => service.dispatch(method, args).await,
    };

    match result {
        Ok(payload) => CallOutcome::Success(payload),
        Err(e) => {
            tracing::debug!(method, error = %e, "Call failed");
            CallOutcome::Error(e.to_string())
        }
    }
}

async fn forward_outbound(mut rx: mpsc::UnboundedReceiver<Frame>, writer: ResponseWriter) {
    while let Some(frame) = rx.recv().await {
        let mut w = writer.lock().await;
        if w.send(frame).await.is_err() {
            break;
        }
    }
}

fn init_tracing(tx: mpsc::UnboundedSender<Frame>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(RunnerLogLayer::new(tx))
        .try_init();
}

/// Install a panic hook that ships a Critical Log frame and aborts.
///
/// A panic in the runner is an invariant violation. The frame is
/// best-effort (the process aborts immediately after); the manager's
/// child-exit handling fails any in-flight call either way.
fn install_panic_hook(tx: mpsc::UnboundedSender<Frame>) {
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        prev(info);

        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<unknown>".to_string()
        };

        let reason = match info.location() {
            Some(location) => format!("panic at {}:{}: {}", location.file(), location.line(), msg),
            None => format!("panic: {}", msg),
        };

        let _ = tx.send(Frame::Log {
            severity: Severity::Critical,
            message: reason,
        });

        std::process::abort();
    }));
}
