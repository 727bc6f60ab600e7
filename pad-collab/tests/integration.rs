//! Integration tests for end-to-end pad synchronization.
//!
//! These tests start a real server and open real pads over WebSockets,
//! verifying the full commit/query/rebase pipeline.

use futures_util::{SinkExt, StreamExt};
use pad_collab::config::PadConfig;
use pad_collab::ot::Selection;
use pad_collab::pad::{Pad, PadEvent};
use pad_collab::protocol::{ClientIdentity, DocId, Request, Response};
use pad_collab::server::{ServerConfig, SyncServer};
use pad_collab::textbox::SharedTextBox;
use pad_collab::transport::ConnectionState;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and a handle to inspect it.
async fn start_test_server() -> (u16, SyncServer) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
    };
    let server = SyncServer::new(config);
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

fn open_pad(port: u16, doc_id: DocId, user: &str) -> (Pad, mpsc::Receiver<PadEvent>) {
    let config = PadConfig::new(
        format!("ws://127.0.0.1:{port}/ws"),
        doc_id,
        ClientIdentity::with_fresh_session(user),
        user,
    )
    .with_interval(Duration::from_millis(20))
    .with_reconnect_delay(Duration::from_millis(20));
    let mut pad = Pad::open(config, SharedTextBox::new());
    let events = pad.take_event_rx().unwrap();
    (pad, events)
}

async fn wait_ready(events: &mut mpsc::Receiver<PadEvent>) -> u64 {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(PadEvent::Ready { view }) = events.recv().await {
                return view;
            }
        }
    })
    .await
    .expect("pad should become ready")
}

/// Poll `check` until it holds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_raw_query_gets_snapshot() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws/1");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text("alice".into())).await.unwrap();
    let query = Request::query(1, "alice", -1).encode().unwrap();
    ws.send(Message::Text(query.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("reply within timeout")
        .unwrap()
        .unwrap();
    let text = match reply {
        Message::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    };
    assert_eq!(
        Response::decode(&text).unwrap(),
        Response::DocRes {
            body: String::new(),
            view: 0,
            seq: 0
        }
    );
}

#[tokio::test]
async fn test_pad_connects_and_becomes_ready() {
    let (port, _server) = start_test_server().await;
    let (pad, mut events) = open_pad(port, 1, "alice");

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(first, Some(PadEvent::Connected));
    assert_eq!(wait_ready(&mut events).await, 0);

    assert!(pad.textbox().is_editable());
    assert_eq!(pad.status().connection, ConnectionState::Connected);
    pad.kill().await;
}

#[tokio::test]
async fn test_typed_text_reaches_server() {
    let (port, server) = start_test_server().await;
    let (pad, mut events) = open_pad(port, 2, "alice");
    wait_ready(&mut events).await;

    assert!(pad.textbox().type_text("hello"));
    let (server, pad_ref) = (&server, &pad);
    eventually("server to hold the text", || async move {
        server.document(2).await.map(|(body, _)| body) == Some("hello".to_string())
    })
    .await;
    eventually("commit to be acknowledged", || async move {
        let status = pad_ref.status();
        status.outstanding_ops == 0 && status.view == Some(1)
    })
    .await;
    assert_eq!(pad.status().seq, 1);

    pad.kill().await;
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let (port, server) = start_test_server().await;
    let (alice, mut alice_events) = open_pad(port, 3, "alice");
    wait_ready(&mut alice_events).await;
    alice.textbox().type_text("shared");
    let server = &server;
    eventually("server to hold the text", || async move {
        server.document(3).await.map(|(body, _)| body) == Some("shared".to_string())
    })
    .await;

    let (bob, mut bob_events) = open_pad(port, 3, "bob");
    assert_eq!(wait_ready(&mut bob_events).await, 1);
    assert_eq!(bob.textbox().value(), "shared");

    alice.kill().await;
    bob.kill().await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (port, server) = start_test_server().await;
    let (alice, mut alice_events) = open_pad(port, 4, "alice");
    let (bob, mut bob_events) = open_pad(port, 4, "bob");
    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    alice.textbox().type_text("abc");
    let (a, b, server) = (&alice, &bob, &server);
    eventually("bob to see alice's text", || async move { b.textbox().value() == "abc" }).await;
    eventually("alice to settle", || async move { a.status().outstanding_ops == 0 }).await;

    // alice prepends while bob appends
    alice.textbox().edit(|tb| {
        tb.select(Selection::caret(0));
        tb.insert("X");
    });
    bob.textbox().edit(|tb| {
        tb.select(Selection::caret(3));
        tb.insert("Y");
    });

    eventually("both pads to converge", || async move {
        a.textbox().value() == "XabcY" && b.textbox().value() == "XabcY"
    })
    .await;
    eventually("server to converge", || async move {
        server.document(4).await == Some(("XabcY".to_string(), 3))
    })
    .await;

    // bob's caret stayed after his own insert
    assert_eq!(bob.textbox().selection(), Selection::caret(5));

    alice.kill().await;
    bob.kill().await;
}

#[tokio::test]
async fn test_pad_reconnects_to_late_server() {
    let port = free_port().await;
    let (pad, mut events) = open_pad(port, 5, "alice");

    // nothing listening yet; the transport keeps retrying
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(pad.status().connection, ConnectionState::Disconnected);

    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });

    wait_ready(&mut events).await;
    assert!(pad.textbox().is_editable());
    pad.kill().await;
}

#[tokio::test]
async fn test_server_stats() {
    let (port, server) = start_test_server().await;
    let (pad, mut events) = open_pad(port, 6, "alice");
    wait_ready(&mut events).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 1);

    pad.kill().await;
}
