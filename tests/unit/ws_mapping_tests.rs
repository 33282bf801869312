//! Unit tests for the WebSocket frame adapters at the transport edge.

use axum::extract::ws::Message;
use futures_util::{stream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use adapter_bridge::transport::ws::{client_messages, client_sink};
use adapter_bridge::AppError;

/// Text passes through, control frames are skipped, and close ends the stream.
#[tokio::test]
async fn client_frames_map_to_text_payloads() {
    let frames = stream::iter(vec![
        Ok(Message::Text("{\"id\":1}".into())),
        Ok(Message::Ping(Vec::new().into())),
        Ok(Message::Binary(b"{\"id\":2}".to_vec().into())),
        Ok(Message::Close(None)),
        Ok(Message::Text("after close".into())),
    ]);

    let payloads: Vec<String> = client_messages(frames)
        .map(|item| item.expect("payload"))
        .collect()
        .await;

    assert_eq!(payloads, vec!["{\"id\":1}".to_owned(), "{\"id\":2}".to_owned()]);
}

/// Binary frames that are not UTF-8 are dropped.
#[tokio::test]
async fn non_utf8_binary_frame_is_dropped() {
    let frames = stream::iter(vec![
        Ok(Message::Binary(vec![0xff, 0xfe].into())),
        Ok(Message::Text("ok".into())),
    ]);

    let payloads: Vec<String> = client_messages(frames)
        .map(|item| item.expect("payload"))
        .collect()
        .await;

    assert_eq!(payloads, vec!["ok".to_owned()]);
}

/// Socket errors surface as transport errors.
#[tokio::test]
async fn socket_error_is_transport_error() {
    let frames = stream::iter(vec![Err(axum::Error::new(std::io::Error::other("reset")))]);

    let mut payloads = client_messages(frames);
    let first = payloads.next().await.expect("one item");
    assert!(matches!(first, Err(AppError::Transport(_))));
    assert!(payloads.next().await.is_none());
}

/// Outbound payloads become text frames.
#[tokio::test]
async fn outbound_payloads_become_text_frames() {
    let (tx, mut rx) = mpsc::channel::<Message>(4);
    let mut sink = client_sink(PollSender::new(tx));

    sink.send("{\"result\":null}".to_owned()).await.expect("send");
    sink.close().await.expect("close");

    match rx.recv().await.expect("one frame") {
        Message::Text(text) => assert_eq!(text.as_str(), "{\"result\":null}"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// The adapted sink can be moved onto another task, as sessions are.
#[tokio::test]
async fn client_sink_runs_on_a_spawned_task() {
    let (tx, mut rx) = mpsc::channel::<Message>(4);
    let sink = client_sink(PollSender::new(tx));

    let sender = tokio::spawn(async move {
        let mut sink = sink;
        sink.send("{\"id\":1}".to_owned()).await.expect("send");
    });
    sender.await.expect("no panic");

    assert!(matches!(rx.recv().await, Some(Message::Text(_))));
}
