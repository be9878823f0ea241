//! Adapter behavior against real subprocesses.
//!
//! `cat` makes a convenient echo peer: it reflects each request line, which
//! the reader then treats as a response carrying our own id (no `result`
//! member, so the call completes with `Null`).

#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use bridge_mcp::{AdapterError, AdapterOptions, AdapterState, LaunchSpec, StdioAdapter};

fn spec(command: &str, args: &[&str]) -> LaunchSpec {
    LaunchSpec {
        name: "test".to_string(),
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        env: HashMap::new(),
        cwd: Some(std::env::temp_dir()),
    }
}

#[tokio::test]
async fn echo_roundtrip_correlates_by_id() {
    let adapter = StdioAdapter::spawn(&spec("cat", &[])).await.expect("spawn cat");
    assert_eq!(adapter.state(), AdapterState::Ready);

    let out = adapter
        .call("ping", Some(serde_json::json!({"x": 1})), Duration::from_secs(5))
        .await
        .expect("echoed response");
    assert!(out.is_null());

    // Concurrent calls each get their own id and their own completion.
    let (a, b) = tokio::join!(
        adapter.call("a", None, Duration::from_secs(5)),
        adapter.call("b", None, Duration::from_secs(5)),
    );
    a.expect("first concurrent call");
    b.expect("second concurrent call");

    adapter.close().await;
    assert_eq!(adapter.state(), AdapterState::Dead);
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let err = StdioAdapter::spawn(&spec("/nonexistent-mcp-server", &[]))
        .await
        .err()
        .expect("spawn must fail");
    assert!(matches!(err, AdapterError::Spawn { .. }), "got {err:?}");
}

#[tokio::test]
async fn eof_terminates_and_drains_waiters() {
    // `true` exits immediately; the in-flight call must fail with
    // Terminated, not hang until the timeout.
    let adapter = StdioAdapter::spawn(&spec("true", &[])).await.expect("spawn true");

    let err = adapter
        .call("ping", None, Duration::from_secs(10))
        .await
        .err()
        .expect("call against exited process must fail");
    assert!(matches!(err, AdapterError::Terminated), "got {err:?}");

    // Dead adapters refuse further calls outright.
    let err = adapter
        .call("ping", None, Duration::from_secs(1))
        .await
        .err()
        .expect("second call must fail");
    assert!(matches!(err, AdapterError::Terminated), "got {err:?}");
    assert_eq!(adapter.state(), AdapterState::Dead);
}

#[tokio::test]
async fn single_timeout_leaves_process_running() {
    // `sleep` never writes to stdout, so every call times out.
    let options = AdapterOptions {
        grace_period: Duration::from_millis(200),
        timeout_window: Duration::from_secs(60),
    };
    let adapter = StdioAdapter::spawn_with_options(&spec("sleep", &["30"]), options)
        .await
        .expect("spawn sleep");

    let err = adapter
        .call("ping", None, Duration::from_millis(200))
        .await
        .err()
        .expect("must time out");
    assert!(matches!(err, AdapterError::Timeout(_)), "got {err:?}");
    assert!(adapter.is_alive(), "one timeout must not kill the process");

    adapter.close().await;
}

#[tokio::test]
async fn repeated_timeouts_tear_the_adapter_down() {
    let options = AdapterOptions {
        grace_period: Duration::from_millis(200),
        timeout_window: Duration::from_secs(60),
    };
    let adapter = StdioAdapter::spawn_with_options(&spec("sleep", &["30"]), options)
        .await
        .expect("spawn sleep");

    for _ in 0..2 {
        let _ = adapter.call("ping", None, Duration::from_millis(100)).await;
    }

    // Teardown runs asynchronously; poll for the state to settle.
    for _ in 0..50 {
        if adapter.state() == AdapterState::Dead {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(adapter.state(), AdapterState::Dead);
}

#[tokio::test]
async fn close_rejects_subsequent_calls() {
    let adapter = StdioAdapter::spawn(&spec("cat", &[])).await.expect("spawn cat");
    adapter.close().await;

    let err = adapter
        .call("ping", None, Duration::from_secs(1))
        .await
        .err()
        .expect("closed adapter must refuse calls");
    assert!(matches!(err, AdapterError::Terminated), "got {err:?}");
    assert!(!adapter.is_alive());
}
