//! Integration tests for session registration and coordinated shutdown.

use std::time::Duration;

use futures_util::stream;
use tokio_util::sync::CancellationToken;

use adapter_bridge::orchestrator::SessionManager;
use adapter_bridge::session::{CloseReason, SessionState};

use adapter_bridge::Result;

use super::test_helpers::{client_pair, initialize, profile, wait_for_state, STEP_TIMEOUT};

const CAT: (&str, &str, &[&str]) = ("default", "cat", &[]);

async fn wait_until_empty(manager: &SessionManager) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !manager.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sessions must unregister");
}

/// Opened sessions are listed with their listener and state, and removed
/// once they terminate.
#[tokio::test]
async fn sessions_are_tracked_until_terminated() {
    let manager = SessionManager::new(CancellationToken::new());
    let (mut client, inbound, outbound) = client_pair();

    let mut handle = manager.open(profile(&[CAT]), inbound, outbound).await;
    client.send(&initialize(1, "rust")).await;
    client.recv().await;
    wait_for_state(&mut handle.state, SessionState::Active).await;

    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, handle.id);
    assert_eq!(snapshot[0].listener, "test");
    assert_eq!(snapshot[0].state, SessionState::Active);

    drop(client.to_bridge);
    let reason = handle.task.await.expect("no panic");
    assert_eq!(reason, CloseReason::ClientDisconnected);
    wait_until_empty(&manager).await;
}

/// Session identifiers are unique.
#[tokio::test]
async fn session_ids_are_unique() {
    let manager = SessionManager::new(CancellationToken::new());
    let (_c1, in1, out1) = client_pair();
    let (_c2, in2, out2) = client_pair();

    let first = manager.open(profile(&[CAT]), in1, out1).await;
    let second = manager.open(profile(&[CAT]), in2, out2).await;

    assert_ne!(first.id, second.id);
    assert_eq!(manager.len().await, 2);
    manager.shutdown(STEP_TIMEOUT).await;
}

/// Closing one session leaves the others running.
#[tokio::test]
async fn close_cancels_only_the_named_session() {
    let manager = SessionManager::new(CancellationToken::new());
    let (mut c1, in1, out1) = client_pair();
    let (mut c2, in2, out2) = client_pair();
    let first = manager.open(profile(&[CAT]), in1, out1).await;
    let mut second = manager.open(profile(&[CAT]), in2, out2).await;

    c1.send(&initialize(1, "rust")).await;
    c2.send(&initialize(1, "rust")).await;
    c1.recv().await;
    c2.recv().await;

    assert!(manager.close(&first.id).await);
    assert_eq!(first.task.await.expect("no panic"), CloseReason::Cancelled);

    c2.send("{\"id\":2}").await;
    assert_eq!(c2.recv_json().await["id"], 2);
    assert_eq!(*second.state.borrow_and_update(), SessionState::Active);

    assert!(!manager.close("no-such-session").await);
    manager.shutdown(STEP_TIMEOUT).await;
}

/// Shutdown cancels every session and waits for each to terminate.
#[tokio::test]
async fn shutdown_terminates_all_sessions() {
    let manager = SessionManager::new(CancellationToken::new());
    let mut handles = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (mut client, inbound, outbound) = client_pair();
        let handle = manager.open(profile(&[CAT]), inbound, outbound).await;
        client.send(&initialize(1, "rust")).await;
        client.recv().await;
        handles.push(handle);
        clients.push(client);
    }

    let remaining = manager.shutdown(STEP_TIMEOUT).await;
    assert_eq!(remaining, 0);
    assert!(manager.is_shutting_down());

    for mut handle in handles {
        wait_for_state(&mut handle.state, SessionState::Terminated).await;
        assert_eq!(handle.task.await.expect("no panic"), CloseReason::Cancelled);
    }
    wait_until_empty(&manager).await;
}

/// A session opened after shutdown ends immediately.
#[tokio::test]
async fn open_after_shutdown_ends_immediately() {
    let manager = SessionManager::new(CancellationToken::new());
    manager.shutdown(Duration::from_millis(100)).await;

    let (_client, inbound, outbound) = client_pair();
    let handle = manager.open(profile(&[CAT]), inbound, outbound).await;

    let reason = tokio::time::timeout(STEP_TIMEOUT, handle.task)
        .await
        .expect("must end")
        .expect("no panic");
    assert_eq!(reason, CloseReason::Cancelled);
}

/// A session whose task panics is still removed from the tracking set.
#[tokio::test]
async fn panicked_session_is_unregistered() {
    let manager = SessionManager::new(CancellationToken::new());
    let (_client, _inbound, outbound) = client_pair();
    let exploding = stream::poll_fn(|_| -> std::task::Poll<Option<Result<String>>> {
        panic!("client stream failed")
    });

    let handle = manager.open(profile(&[CAT]), exploding, outbound).await;

    let joined = tokio::time::timeout(STEP_TIMEOUT, handle.task)
        .await
        .expect("task must end");
    assert!(joined.expect_err("task must panic").is_panic());
    wait_until_empty(&manager).await;
}
