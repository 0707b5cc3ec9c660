//! Manager core - owns the runner subprocess and the session lifecycle.
//!
//! Flow:
//! 1. Bind both session endpoints, spawn the runner
//! 2. Accept command then response, racing runner exit and the startup timeout
//! 3. Run a dedicated reader task routing Response/Event/Log frames
//! 4. Calls go through the pending registry; on runner crash every pending
//!    call fails and later calls fail the same way immediately

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::payload;
use crate::bridge::protocol::{self, CallOutcome, Frame, Severity};
use crate::bridge::transport::{EndpointNames, SessionListener};
use crate::events::{EventHub, EventSubscription};
use crate::pending::PendingCalls;

/// Message carried by every failure caused by the runner dying mid-session.
pub(crate) const RUNNER_EXITED: &str = "Process exited unexpectedly";

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("session transport failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("failed to spawn runner: {0}")]
    Spawn(String),
    #[error("runner exited during startup: {status}")]
    RunnerExited { status: ExitStatus },
    #[error("timed out waiting for the runner to connect")]
    Timeout,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The method ran and failed; the message is the runner-side root cause.
    #[error("{0}")]
    Remote(String),

    /// The runner died before the reply arrived. The message contains
    /// "Process exited unexpectedly".
    #[error("{0}")]
    Exited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("reply payload did not decode: {0}")]
    Decode(String),

    /// The session was shut down locally.
    #[error("session is shut down")]
    SessionClosed,
}

impl CallError {
    pub(crate) fn exited() -> Self {
        Self::Exited(RUNNER_EXITED.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("failed to await runner exit: {0}")]
    Wait(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Everything a spawner needs to launch the runner process.
pub struct SpawnContext<'a> {
    pub service_id: &'a str,
    pub endpoints: &'a EndpointNames,
}

/// Extension point for different runner spawn strategies.
pub trait RunnerSpawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext<'_>) -> Result<Child, SpawnError>;
}

/// Default spawner: runs `program` with the runner-mode arguments appended
/// and both output streams piped back to the manager's logger.
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl RunnerSpawner for CommandSpawner {
    fn spawn(&self, ctx: &SpawnContext<'_>) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--process")
            .arg(ctx.service_id)
            .arg("--command-pipe")
            .arg(&ctx.endpoints.command)
            .arg("--response-pipe")
            .arg(&ctx.endpoints.response)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct ManagerConfig {
    service_id: String,
    startup_timeout: Duration,
    stop_timeout: Duration,
    spawner: Arc<dyn RunnerSpawner>,
}

impl ManagerConfig {
    pub fn new(service_id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            service_id: service_id.into(),
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            spawner: Arc::new(CommandSpawner::new(program)),
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn RunnerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Manager-side session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unspawned,
    Spawning,
    Ready,
    Stopping,
    Stopped,
}

struct Shared {
    pending: PendingCalls,
    events: EventHub,
    writer: tokio::sync::Mutex<Option<FramedWrite<UnixStream, FrameCodec>>>,
    state: StdMutex<SessionState>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }
}

struct Control {
    child: Child,
    // Held for Drop cleanup of the session's socket directory.
    _listener: SessionListener,
    reader: Option<JoinHandle<()>>,
    output_forwarders: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
    stopped: bool,
}

/// A live session with a runner-hosted service.
///
/// Calls, event subscriptions and shutdown all take `&self`; the manager is
/// shareable behind an `Arc` for concurrent callers.
pub struct ServiceManager {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<Control>,
    stop_timeout: Duration,
}

impl ServiceManager {
    /// Spawn the runner and bring the session to Ready.
    pub async fn start(config: ManagerConfig) -> Result<Self, StartupError> {
        let shared = Arc::new(Shared {
            pending: PendingCalls::new(),
            events: EventHub::new(),
            writer: tokio::sync::Mutex::new(None),
            state: StdMutex::new(SessionState::Unspawned),
        });
        shared.set_state(SessionState::Spawning);

        let (listener, endpoints) = SessionListener::bind()?;

        tracing::info!(service = %config.service_id, "Spawning runner");
        let ctx = SpawnContext {
            service_id: &config.service_id,
            endpoints: &endpoints,
        };
        let mut child = config
            .spawner
            .spawn(&ctx)
            .map_err(|e| StartupError::Spawn(e.to_string()))?;

        let mut output_forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            output_forwarders.push(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            output_forwarders.push(forward_output(stderr, "stderr"));
        }

        // The runner connects command first, then response; accept in the
        // same order, bailing out if it dies before either connection.
        let command = accept_with_watchdog(
            listener.accept_command(),
            &mut child,
            config.startup_timeout,
        )
        .await?;
        let response = accept_with_watchdog(
            listener.accept_response(),
            &mut child,
            config.startup_timeout,
        )
        .await?;

        {
            let mut writer = shared.writer.lock().await;
            *writer = Some(FramedWrite::new(command, FrameCodec::new()));
        }

        let reader = tokio::spawn(read_loop(
            FramedRead::new(response, FrameCodec::new()),
            Arc::clone(&shared),
        ));

        shared.set_state(SessionState::Ready);
        tracing::info!(service = %config.service_id, "Session ready");

        Ok(Self {
            shared,
            control: tokio::sync::Mutex::new(Control {
                child,
                _listener: listener,
                reader: Some(reader),
                output_forwarders,
                exit_status: None,
                stopped: false,
            }),
            stop_timeout: config.stop_timeout,
        })
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.state()
    }

    /// Issue a call and await its reply. `Ok(None)` means the method
    /// completed without a return value.
    pub async fn send_call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, CallError> {
        let (id, rx) = self.shared.pending.register()?;
        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args,
        };

        {
            let mut guard = self.shared.writer.lock().await;
            let writer = match guard.as_mut() {
                Some(writer) => writer,
                None => {
                    self.shared.pending.discard(id);
                    return Err(CallError::SessionClosed);
                }
            };
            if let Err(e) = writer.send(frame).await {
                self.shared.pending.discard(id);
                return Err(CallError::Transport(e.to_string()));
            }
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(CallError::exited()),
        }
    }

    /// Call a method whose reply carries a value of the declared type.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, CallError> {
        match self.send_call(method, args).await? {
            Some(value) => payload::from_value(value).map_err(|e| CallError::Decode(e.to_string())),
            None => Err(CallError::Decode("reply carried no payload".to_string())),
        }
    }

    /// Call a method with no return value; any payload is discarded.
    pub async fn call_unit(&self, method: &str, args: Vec<Value>) -> Result<(), CallError> {
        self.send_call(method, args).await.map(|_| ())
    }

    /// Register a typed subscriber for a service event.
    pub fn subscribe<T, F>(&self, event: &str, handler: F) -> EventSubscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(event, handler)
    }

    /// Remove a previously registered subscriber.
    pub fn unsubscribe(&self, subscription: &EventSubscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }

    /// Stop the session.
    ///
    /// Sends a best-effort `stop_async` when the runner is still reachable,
    /// closes both transports, detaches the output forwarders, and awaits
    /// the runner's exit (forcing termination if it lingers). Calling this
    /// again is a no-op that returns the recorded exit status.
    pub async fn graceful_shutdown(&self) -> Result<Option<ExitStatus>, ShutdownError> {
        let mut control = self.control.lock().await;
        if control.stopped {
            return Ok(control.exit_status);
        }
        self.shared.set_state(SessionState::Stopping);

        let writer_live = self.shared.writer.lock().await.is_some();
        if writer_live && !self.shared.pending.is_closed() {
            match tokio::time::timeout(
                self.stop_timeout,
                self.send_call(protocol::STOP_METHOD, Vec::new()),
            )
            .await
            {
                Ok(Ok(_)) => tracing::debug!("Runner acknowledged stop"),
                Ok(Err(e)) => tracing::debug!(error = %e, "Stop call failed"),
                Err(_) => tracing::warn!("Timed out waiting for stop acknowledgement"),
            }
        }

        // Dropping the writer closes the command stream, which unblocks the
        // runner's next read even if the stop call raced with its exit.
        *self.shared.writer.lock().await = None;

        for task in control.output_forwarders.drain(..) {
            task.abort();
        }

        let status = match tokio::time::timeout(self.stop_timeout, control.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!("Runner did not exit, terminating");
                let _ = control.child.start_kill();
                control.child.wait().await?
            }
        };

        if let Some(mut reader) = control.reader.take() {
            // The reader ends on its own once the response stream closes.
            if tokio::time::timeout(Duration::from_secs(1), &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }

        control.exit_status = Some(status);
        control.stopped = true;
        self.shared.set_state(SessionState::Stopped);
        tracing::info!(%status, "Session stopped");
        Ok(Some(status))
    }
}

/// Race an endpoint accept against runner exit and the startup timeout.
async fn accept_with_watchdog<F>(
    accept: F,
    child: &mut Child,
    timeout: Duration,
) -> Result<UnixStream, StartupError>
where
    F: Future<Output = std::io::Result<UnixStream>>,
{
    tokio::select! {
        conn = accept => conn.map_err(StartupError::Transport),
        status = child.wait() => match status {
            Ok(status) => Err(StartupError::RunnerExited { status }),
            Err(e) => Err(StartupError::Transport(e)),
        },
        _ = tokio::time::sleep(timeout) => Err(StartupError::Timeout),
    }
}

fn forward_output<R>(stream: R, channel: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "runlet::child", channel, "{}", line);
        }
    })
}

/// Consume response frames until the stream closes or a read errors. This
/// task owns the read side exclusively.
async fn read_loop(mut reader: FramedRead<UnixStream, FrameCodec>, shared: Arc<Shared>) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(Frame::Response { id, outcome }) => {
                let reply = match outcome {
                    CallOutcome::Success(value) => Ok(value),
                    CallOutcome::Error(message) => Err(CallError::Remote(message)),
                };
                if !shared.pending.complete(id, reply) {
                    tracing::debug!(id, "Dropping response with no pending call");
                }
            }
            Ok(Frame::Event { name, payload }) => {
                let value = payload.unwrap_or(Value::Nil);
                shared.events.dispatch(&name, &value);
            }
            Ok(Frame::Log { severity, message }) => {
                emit_runner_log(severity, &message);
            }
            Ok(frame @ Frame::Call { .. }) => {
                tracing::warn!(?frame, "Ignoring unexpected frame on response stream");
            }
            Err(e) => {
                tracing::error!(error = %e, "Response stream error");
                break;
            }
        }
    }
    tracing::debug!("Response stream closed");

    shared.pending.close(RUNNER_EXITED);
    if shared.state() == SessionState::Ready {
        shared.set_state(SessionState::Stopping);
    }
}

/// Re-emit a runner log record through the manager's subscriber.
fn emit_runner_log(severity: Severity, message: &str) {
    match severity {
        Severity::Trace => tracing::trace!(target: "runlet::service", "{message}"),
        Severity::Debug => tracing::debug!(target: "runlet::service", "{message}"),
        Severity::Information | Severity::None => {
            tracing::info!(target: "runlet::service", "{message}")
        }
        Severity::Warning => tracing::warn!(target: "runlet::service", "{message}"),
        Severity::Error | Severity::Critical => {
            tracing::error!(target: "runlet::service", "{message}")
        }
    }
}
