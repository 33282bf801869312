//! Integration tests for the session lifecycle, driven end to end.
//!
//! Each test runs a real [`Session`] against a real adapter process and a
//! fake client made of in-memory channels.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use adapter_bridge::session::notice::{ADAPTER_EXITED_METHOD, INTERNAL_ERROR_CODE, SPAWN_FAILED_METHOD};
use adapter_bridge::session::{CloseReason, Session, SessionState};

use super::test_helpers::{
    client_pair, initialize, padded_message, profile, profile_from, profile_with,
    test_session_config, wait_for_state, STEP_TIMEOUT,
};

const CAT: (&str, &str, &[&str]) = ("default", "cat", &[]);

fn start(
    profile: std::sync::Arc<adapter_bridge::session::BridgeProfile>,
) -> (
    super::test_helpers::TestClient,
    tokio::sync::watch::Receiver<SessionState>,
    tokio::task::JoinHandle<CloseReason>,
    CancellationToken,
) {
    let cancel = CancellationToken::new();
    let session = Session::new("session-under-test".into(), profile, cancel.clone());
    let state = session.subscribe();
    let (client, inbound, outbound) = client_pair();
    let task = tokio::spawn(session.run(inbound, outbound));
    (client, state, task, cancel)
}

async fn finish(task: tokio::task::JoinHandle<CloseReason>) -> CloseReason {
    tokio::time::timeout(STEP_TIMEOUT, task)
        .await
        .expect("session must end within timeout")
        .expect("session task must not panic")
}

// ── Forwarding ──────────────────────────────────────────────────────────────

/// The first message is forwarded and echoed, and later messages follow in order.
#[tokio::test]
async fn messages_round_trip_through_echo_adapter() {
    let (mut client, mut state, task, _cancel) = start(profile(&[CAT]));

    let init = initialize(1, "rust");
    client.send(&init).await;
    assert_eq!(client.recv().await.as_deref(), Some(init.as_str()));
    wait_for_state(&mut state, SessionState::Active).await;

    client.send("{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}").await;
    client.send("{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"shutdown\"}").await;
    assert_eq!(client.recv_json().await["method"], "initialized");
    assert_eq!(client.recv_json().await["id"], 2);

    drop(client.to_bridge);
    assert_eq!(finish(task).await, CloseReason::ClientDisconnected);
}

/// An unknown capability is served by the default adapter.
#[tokio::test]
async fn unknown_capability_uses_default_adapter() {
    let (mut client, _state, task, _cancel) = start(profile(&[
        CAT,
        ("rust", "/nonexistent/rust-analyzer", &[]),
    ]));

    client.send(&initialize(1, "cobol")).await;
    let echoed = client.recv_json().await;
    assert_eq!(echoed["params"]["languageId"], "cobol");

    drop(client.to_bridge);
    finish(task).await;
}

/// Messages sent while the adapter is spawning are delivered in order.
#[tokio::test]
async fn messages_queued_during_spawn_are_delivered_in_order() {
    let (mut client, _state, task, _cancel) = start(profile(&[CAT]));

    client.send(&initialize(1, "rust")).await;
    for id in 2..=5 {
        client.send(&format!("{{\"id\":{id}}}")).await;
    }

    let mut ids = Vec::new();
    for _ in 1..=5 {
        ids.push(client.recv_json().await["id"].as_u64().expect("numeric id"));
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    drop(client.to_bridge);
    finish(task).await;
}

/// With forwarding disabled the capability message is not sent to the adapter.
#[tokio::test]
async fn first_message_is_withheld_when_not_forwarded() {
    let (mut client, mut state, task, _cancel) = start(profile_with(&[CAT], false));

    client.send(&initialize(1, "rust")).await;
    wait_for_state(&mut state, SessionState::Active).await;
    client.send("{\"id\":2}").await;

    assert_eq!(client.recv_json().await["id"], 2);

    drop(client.to_bridge);
    finish(task).await;
}

/// Malformed client payloads are dropped without ending the session.
#[tokio::test]
async fn malformed_client_payloads_are_dropped() {
    let (mut client, _state, task, _cancel) = start(profile(&[CAT]));

    client.send("not json at all").await;
    client.send(&initialize(1, "rust")).await;
    client.send("{\"unterminated\":").await;
    client.send("{\"id\":2}").await;

    assert_eq!(client.recv_json().await["id"], 1);
    assert_eq!(client.recv_json().await["id"], 2);

    drop(client.to_bridge);
    finish(task).await;
}

/// Frames with non-UTF-8 bodies are dropped; the next frame still arrives.
#[tokio::test]
async fn non_utf8_frame_body_is_dropped() {
    let script = r"printf 'Content-Length: 2\r\n\r\n\377\376Content-Length: 2\r\n\r\nok'; sleep 5";
    let (mut client, _state, task, _cancel) =
        start(profile(&[("default", "sh", &["-c", script])]));

    client.send(&initialize(1, "rust")).await;
    assert_eq!(client.recv().await.as_deref(), Some("ok"));

    drop(client.to_bridge);
    finish(task).await;
}

// ── Stalled adapters ────────────────────────────────────────────────────────

const SLEEPER: (&str, &str, &[&str]) = ("default", "sleep", &["60"]);

/// Fill the adapter's stdin pipe and writer queue with large messages.
async fn flood(client: &super::test_helpers::TestClient, count: u64) {
    for id in 2..2 + count {
        if client.to_bridge.send(Ok(padded_message(id, 100_000))).await.is_err() {
            break;
        }
    }
}

/// A client disconnect ends the session even when the adapter never reads stdin.
#[tokio::test]
async fn disconnect_is_seen_while_adapter_ignores_stdin() {
    let (client, mut state, task, _cancel) = start(profile(&[SLEEPER]));

    client.send(&initialize(1, "rust")).await;
    wait_for_state(&mut state, SessionState::Active).await;
    flood(&client, 100).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    drop(client.to_bridge);
    let reason = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("disconnect must end a stalled session promptly")
        .expect("no panic");
    assert_eq!(reason, CloseReason::ClientDisconnected);
    assert_eq!(*state.borrow(), SessionState::Terminated);
}

/// Cancellation ends the session even when the adapter never reads stdin.
#[tokio::test]
async fn cancellation_is_seen_while_adapter_ignores_stdin() {
    let (client, mut state, task, cancel) = start(profile(&[SLEEPER]));

    client.send(&initialize(1, "rust")).await;
    wait_for_state(&mut state, SessionState::Active).await;
    flood(&client, 100).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    cancel.cancel();
    let reason = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancel must end a stalled session promptly")
        .expect("no panic");
    assert_eq!(reason, CloseReason::Cancelled);
}

/// A backlog past the pending limit closes the session instead of growing.
#[tokio::test]
async fn stdin_backlog_past_limit_closes_session() {
    let session = adapter_bridge::config::SessionConfig {
        write_queue_capacity: 1,
        max_pending_messages: 4,
        ..test_session_config()
    };
    let (client, mut state, task, _cancel) = start(profile_from(&[SLEEPER], true, &session));

    client.send(&initialize(1, "rust")).await;
    wait_for_state(&mut state, SessionState::Active).await;
    flood(&client, 200).await;

    let reason = finish(task).await;
    assert!(
        matches!(reason, CloseReason::WriteFailed(ref msg) if msg.contains("backlog")),
        "unexpected close reason: {reason}"
    );
}

// ── Teardown ────────────────────────────────────────────────────────────────

/// A client disconnect tears down the adapter and reaches `Terminated`.
#[tokio::test]
async fn client_disconnect_terminates_session() {
    let (mut client, mut state, task, _cancel) = start(profile(&[CAT]));

    client.send(&initialize(1, "rust")).await;
    client.recv().await;
    wait_for_state(&mut state, SessionState::Active).await;

    drop(client.to_bridge);
    assert_eq!(finish(task).await, CloseReason::ClientDisconnected);
    assert_eq!(*state.borrow(), SessionState::Terminated);
    assert!(
        client.from_bridge.recv().await.is_none(),
        "no notice is sent for a client-initiated close"
    );
}

/// A disconnect before any capability arrives goes straight to `Terminated`.
#[tokio::test]
async fn disconnect_while_idle_terminates_without_spawn() {
    let (client, mut state, task, _cancel) = start(profile(&[CAT]));

    drop(client.to_bridge);
    assert_eq!(finish(task).await, CloseReason::ClientDisconnected);
    wait_for_state(&mut state, SessionState::Terminated).await;
}

/// An adapter crash reaches the client as a notice with the stderr tail.
#[tokio::test]
async fn adapter_crash_sends_exit_notice_and_closes() {
    let script = "read line; echo 'index corrupt' >&2; exit 7";
    let (mut client, mut state, task, _cancel) =
        start(profile(&[("default", "sh", &["-c", script])]));

    client.send(&initialize(1, "rust")).await;

    let notice = client.recv_json().await;
    assert_eq!(notice["method"], ADAPTER_EXITED_METHOD);
    assert_eq!(notice["params"]["code"], 7);
    assert!(notice["params"]["stderr"]
        .as_str()
        .is_some_and(|s| s.contains("index corrupt")));

    assert!(client.recv().await.is_none(), "bridge must close the client");
    let reason = finish(task).await;
    assert!(matches!(reason, CloseReason::ProcessExited(ref r) if r.code == Some(7)));
    wait_for_state(&mut state, SessionState::Terminated).await;
}

/// A spawn failure answers the triggering request and closes the session.
#[tokio::test]
async fn spawn_failure_answers_request_and_closes() {
    let (mut client, mut state, task, _cancel) =
        start(profile(&[("default", "/nonexistent/adapter-binary", &[])]));

    client.send(&initialize(9, "rust")).await;

    let response = client.recv_json().await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], INTERNAL_ERROR_CODE);
    assert!(client.recv().await.is_none());

    assert!(matches!(finish(task).await, CloseReason::SpawnFailed(_)));
    wait_for_state(&mut state, SessionState::Terminated).await;
}

/// A spawn failure triggered by a notification is reported as a notification.
#[tokio::test]
async fn spawn_failure_after_notification_is_notification() {
    let (mut client, _state, task, _cancel) =
        start(profile(&[("default", "/nonexistent/adapter-binary", &[])]));

    client
        .send("{\"jsonrpc\":\"2.0\",\"method\":\"launch\",\"params\":{\"languageId\":\"x\"}}")
        .await;

    assert_eq!(client.recv_json().await["method"], SPAWN_FAILED_METHOD);
    finish(task).await;
}

/// Cancellation stops an active session and its adapter without a notice.
#[tokio::test]
async fn cancellation_closes_active_session() {
    let (mut client, mut state, task, cancel) = start(profile(&[("default", "sleep", &["30"])]));

    client.send(&initialize(1, "rust")).await;
    wait_for_state(&mut state, SessionState::Active).await;

    cancel.cancel();
    let reason = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancel must finish promptly")
        .expect("no panic");
    assert_eq!(reason, CloseReason::Cancelled);
    assert!(client.recv().await.is_none());
}
