//! End-to-end tests driving a real runner subprocess (`runlet-demo`).

use std::sync::Arc;
use std::time::Duration;

use runlet::{CallError, ManagerConfig, ServiceManager, SessionState, to_value};

const SERVICE_ID: &str = "demo.DemoService";

fn demo_config() -> ManagerConfig {
    ManagerConfig::new(SERVICE_ID, env!("CARGO_BIN_EXE_runlet-demo"))
        .with_startup_timeout(Duration::from_secs(20))
        .with_stop_timeout(Duration::from_secs(5))
}

async fn start_demo() -> ServiceManager {
    ServiceManager::start(demo_config())
        .await
        .expect("demo session should start")
}

#[tokio::test]
async fn add_returns_the_sum() {
    let manager = start_demo().await;

    let sum: i64 = manager
        .call(
            "add",
            vec![to_value(5).unwrap(), to_value(3).unwrap()],
        )
        .await
        .unwrap();
    assert_eq!(sum, 8);

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn echo_without_subscriber_still_returns() {
    let manager = start_demo().await;

    let echoed: String = manager
        .call("echo", vec![to_value("Hello").unwrap()])
        .await
        .unwrap();
    assert_eq!(echoed, "Echoed: Hello");

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn echo_event_reaches_the_subscriber() {
    let manager = start_demo().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    manager.subscribe::<String, _>("on_message", move |message| {
        let _ = tx.send(message);
    });

    let echoed: String = manager
        .call("echo", vec![to_value("World").unwrap()])
        .await
        .unwrap();
    assert_eq!(echoed, "Echoed: World");

    let event = tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("event should arrive within 100ms")
        .expect("event channel should stay open");
    assert_eq!(event, "Echoed: World");

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn events_arrive_in_emission_order() {
    let manager = start_demo().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    manager.subscribe::<String, _>("on_message", move |message| {
        let _ = tx.send(message);
    });

    for word in ["one", "two", "three"] {
        let _: String = manager
            .call("echo", vec![to_value(word).unwrap()])
            .await
            .unwrap();
    }

    for expected in ["Echoed: one", "Echoed: two", "Echoed: three"] {
        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("event should arrive")
            .expect("event channel should stay open");
        assert_eq!(event, expected);
    }

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let manager = start_demo().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let subscription = manager.subscribe::<String, _>("on_message", move |message| {
        let _ = tx.send(message);
    });
    assert!(manager.unsubscribe(&subscription));

    let _: String = manager
        .call("echo", vec![to_value("quiet").unwrap()])
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "no event should be delivered after unsubscribing"
    );

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn method_failure_carries_the_root_cause() {
    let manager = start_demo().await;

    match manager.send_call("throw_exception", Vec::new()).await {
        Err(CallError::Remote(message)) => assert!(message.contains("Test exception")),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The session survives a failing call.
    let sum: i64 = manager
        .call(
            "add",
            vec![to_value(1).unwrap(), to_value(2).unwrap()],
        )
        .await
        .unwrap();
    assert_eq!(sum, 3);

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_method_reports_not_found() {
    let manager = start_demo().await;

    match manager.send_call("frobnicate", Vec::new()).await {
        Err(CallError::Remote(message)) => {
            assert_eq!(message, "Method frobnicate not found");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn hard_exit_fails_pending_and_subsequent_calls() {
    let manager = start_demo().await;

    match manager.send_call("hard_exit", Vec::new()).await {
        Err(e) => assert!(e.to_string().contains("Process exited unexpectedly")),
        Ok(reply) => panic!("hard_exit unexpectedly replied: {reply:?}"),
    }

    // Subsequent calls fail the same way, immediately.
    match manager.send_call("add", Vec::new()).await {
        Err(e) => assert!(e.to_string().contains("Process exited unexpectedly")),
        Ok(reply) => panic!("call after exit unexpectedly replied: {reply:?}"),
    }

    let status = manager.graceful_shutdown().await.unwrap();
    assert_eq!(status.and_then(|s| s.code()), Some(1));
    assert_eq!(manager.session_state(), SessionState::Stopped);
}

#[tokio::test]
async fn graceful_shutdown_is_clean_and_idempotent() {
    let manager = start_demo().await;
    assert_eq!(manager.session_state(), SessionState::Ready);

    let status = manager
        .graceful_shutdown()
        .await
        .unwrap()
        .expect("exit status should be recorded");
    assert!(status.success(), "runner should exit 0 on graceful stop");
    assert_eq!(manager.session_state(), SessionState::Stopped);

    // Second call is a no-op returning the same status.
    let again = manager.graceful_shutdown().await.unwrap();
    assert_eq!(again.map(|s| s.code()), Some(status.code()));
    assert_eq!(manager.session_state(), SessionState::Stopped);
}

#[tokio::test]
async fn calls_after_shutdown_fail() {
    let manager = start_demo().await;
    manager.graceful_shutdown().await.unwrap();

    match manager.send_call("add", Vec::new()).await {
        Err(CallError::Exited(message)) => {
            assert!(message.contains("Process exited unexpectedly"));
        }
        Err(CallError::SessionClosed) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn zero_argument_call_and_absent_payload() {
    let manager = start_demo().await;

    manager.call_unit("touch", Vec::new()).await.unwrap();

    let reply = manager.send_call("touch", Vec::new()).await.unwrap();
    assert!(reply.is_none(), "touch should reply without a payload");

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_reply() {
    let manager = Arc::new(start_demo().await);

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let sum: i64 = manager
                .call(
                    "add",
                    vec![to_value(i).unwrap(), to_value(i).unwrap()],
                )
                .await
                .unwrap();
            (i, sum)
        }));
    }

    for handle in handles {
        let (i, sum) = handle.await.unwrap();
        assert_eq!(sum, i * 2);
    }

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_payload_still_round_trips() {
    let manager = start_demo().await;

    // Larger than any default socket buffer; the writer blocks until the
    // runner drains.
    let big = "x".repeat(5 * 1024 * 1024);
    let echoed: String = manager
        .call("echo", vec![to_value(big.as_str()).unwrap()])
        .await
        .unwrap();
    assert_eq!(echoed.len(), big.len() + "Echoed: ".len());
    assert!(echoed.starts_with("Echoed: x"));

    manager.graceful_shutdown().await.unwrap();
}

#[tokio::test]
async fn respawn_yields_an_independent_session() {
    let first = start_demo().await;
    let sum: i64 = first
        .call(
            "add",
            vec![to_value(2).unwrap(), to_value(2).unwrap()],
        )
        .await
        .unwrap();
    assert_eq!(sum, 4);
    first.graceful_shutdown().await.unwrap();

    let second = start_demo().await;
    let sum: i64 = second
        .call(
            "add",
            vec![to_value(3).unwrap(), to_value(4).unwrap()],
        )
        .await
        .unwrap();
    assert_eq!(sum, 7);
    second.graceful_shutdown().await.unwrap();
}

/// Hand-written typed facade over the generic invoke seam. `stop_async`
/// maps to the manager's graceful-shutdown path rather than a plain call.
struct DemoClient {
    manager: ServiceManager,
}

impl DemoClient {
    async fn connect() -> Self {
        Self {
            manager: start_demo().await,
        }
    }

    async fn add(&self, a: i64, b: i64) -> Result<i64, CallError> {
        self.manager
            .call(
                "add",
                vec![
                    to_value(a).map_err(|e| CallError::Decode(e.to_string()))?,
                    to_value(b).map_err(|e| CallError::Decode(e.to_string()))?,
                ],
            )
            .await
    }

    async fn echo(&self, input: &str) -> Result<String, CallError> {
        self.manager
            .call(
                "echo",
                vec![to_value(input).map_err(|e| CallError::Decode(e.to_string()))?],
            )
            .await
    }

    async fn stop_async(&self) -> Result<(), runlet::ShutdownError> {
        self.manager.graceful_shutdown().await.map(|_| ())
    }
}

#[tokio::test]
async fn typed_facade_drives_the_session() {
    let client = DemoClient::connect().await;

    assert_eq!(client.add(20, 22).await.unwrap(), 42);
    assert_eq!(client.echo("facade").await.unwrap(), "Echoed: facade");

    client.stop_async().await.unwrap();
    assert_eq!(client.manager.session_state(), SessionState::Stopped);
}
