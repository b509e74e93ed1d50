//! Ingestor behavior against local mock services: Discord-style gateway
//! lifecycle (hello → identify → ready → resume after drop), Slack socket
//! mode (URL fetch, ACK-before-buffer), and the HTTP poller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use warden_ingest::{IngestorRegistry, IngestorState, SpawnContext};

fn spawn_ctx(config: Value) -> SpawnContext {
    SpawnContext {
        connection_alias: "conn".into(),
        instance_id: None,
        config: serde_json::from_value(config).expect("valid ingestor config"),
        secrets: HashMap::new(),
        route_headers: HashMap::new(),
        buffer_size: 50,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, predicate: F) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Discord-style mock: HELLO, consume the auth message (reporting its op),
/// emit READY, then either drop the socket or keep serving.
async fn spawn_discord_mock(
    connections: Arc<AtomicUsize>,
    auth_ops: mpsc::UnboundedSender<u64>,
    drop_first_connection: bool,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws mock");
    let addr = listener.local_addr().expect("ws mock addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let n = connections.fetch_add(1, Ordering::SeqCst) + 1;
            let auth_ops = auth_ops.clone();
            let drop_now = drop_first_connection && n == 1;
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let hello = json!({"op": 10, "d": {"heartbeat_interval": 45000}});
                if ws.send(Message::Text(hello.to_string())).await.is_err() {
                    return;
                }
                // IDENTIFY on a fresh session, RESUME after one.
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        let payload: Value = serde_json::from_str(&text).unwrap_or_default();
                        let op = payload["op"].as_u64().unwrap_or(255);
                        if op == 2 || op == 6 {
                            let _ = auth_ops.send(op);
                            break;
                        }
                    }
                }
                let ready = json!({
                    "op": 0,
                    "t": "READY",
                    "s": 1,
                    "d": {"session_id": "sess-1", "resume_gateway_url": null},
                });
                let _ = ws.send(Message::Text(ready.to_string())).await;

                if drop_now {
                    // Abrupt drop: the client observes an abnormal closure
                    // (the 1006 case) and must reconnect.
                    return;
                }
                let dispatch = json!({
                    "op": 0,
                    "t": "MESSAGE_CREATE",
                    "s": 2,
                    "d": {"content": "hello", "guild_id": "g-1"},
                });
                let _ = ws.send(Message::Text(dispatch.to_string())).await;
                // Hold the socket open until the client goes away.
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn discord_identifies_buffers_and_resumes_after_drop() {
    let connections = Arc::new(AtomicUsize::new(0));
    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
    let url = spawn_discord_mock(Arc::clone(&connections), auth_tx, true).await;

    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "websocket",
            "protocol": "discord",
            "gatewayUrl": url,
            "token": "bot-token",
        })))
        .expect("discord ingestor builds");
    ingestor.start().await.expect("starts");

    // First connection authenticates with IDENTIFY.
    let first_auth = tokio::time::timeout(Duration::from_secs(5), auth_rx.recv())
        .await
        .expect("first auth arrives")
        .unwrap();
    assert_eq!(first_auth, 2, "fresh session must IDENTIFY");

    // The mock drops the socket after READY; backoff arms at two seconds
    // and the client reconnects.
    {
        let core = ingestor.core();
        wait_for("reconnecting state", Duration::from_secs(3), || {
            core.state() == IngestorState::Reconnecting
        })
        .await;
    }

    let second_auth = tokio::time::timeout(Duration::from_secs(10), auth_rx.recv())
        .await
        .expect("second auth arrives")
        .unwrap();
    assert_eq!(second_auth, 6, "held session and sequence must RESUME");
    assert!(connections.load(Ordering::SeqCst) >= 2);

    // The second connection stays up and delivers a dispatch.
    {
        let core = ingestor.core();
        wait_for("dispatched event", Duration::from_secs(5), || {
            !core.get_events(None).is_empty()
        })
        .await;
        let events = core.get_events(None);
        assert_eq!(events[0].event_type, "MESSAGE_CREATE");
        assert_eq!(
            events[0].idempotency_key,
            "discord:conn:sess-1:seq:2"
        );
    }

    ingestor.stop().await;
}

#[tokio::test]
async fn discord_terminal_close_code_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // Authentication failed: unrecoverable.
                let _ = ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(4004),
                        reason: "Authentication failed.".into(),
                    })))
                    .await;
            });
        }
    });

    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "websocket",
            "protocol": "discord",
            "gatewayUrl": format!("ws://{addr}"),
            "token": "bad-token",
        })))
        .expect("discord ingestor builds");
    ingestor.start().await.expect("starts");

    let core = ingestor.core();
    wait_for("error state", Duration::from_secs(5), || {
        core.state() == IngestorState::Error
    })
    .await;
    let status = core.status();
    assert!(status.error.unwrap().contains("4004"));
}

#[tokio::test(start_paused = true)]
async fn discord_reconnect_attempts_exhaust_to_error() {
    // Nothing listens on this port: every connect fails, and the paused
    // clock fast-forwards through the exponential backoff.
    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "websocket",
            "protocol": "discord",
            "gatewayUrl": "ws://127.0.0.1:1/gateway",
            "token": "t",
        })))
        .expect("discord ingestor builds");
    ingestor.start().await.expect("starts");

    let core = ingestor.core();
    wait_for("terminal error", Duration::from_secs(600), || {
        core.state() == IngestorState::Error
    })
    .await;
    assert!(core
        .status()
        .error
        .unwrap()
        .contains("reconnect attempts exhausted"));
}

#[tokio::test]
async fn slack_socket_mode_acks_before_buffering() {
    // WS half: hello, one events_api envelope, then wait for the ACK.
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(async move {
        while let Ok((stream, _)) = ws_listener.accept().await {
            let ack_tx = ack_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let _ = ws
                    .send(Message::Text(json!({"type": "hello"}).to_string()))
                    .await;
                let envelope = json!({
                    "type": "events_api",
                    "envelope_id": "e-1",
                    "payload": {"event": {"type": "message", "text": "hi"}},
                });
                let _ = ws.send(Message::Text(envelope.to_string())).await;
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            let _ = ack_tx.send(value);
                        }
                    }
                }
            });
        }
    });

    // HTTP half: apps.connections.open returning the single-use URL.
    let open_calls = Arc::new(AtomicUsize::new(0));
    let open_calls_handler = Arc::clone(&open_calls);
    let app = Router::new().route(
        "/api/apps.connections.open",
        post(move || {
            let open_calls = Arc::clone(&open_calls_handler);
            async move {
                open_calls.fetch_add(1, Ordering::SeqCst);
                Json(json!({"ok": true, "url": format!("ws://{ws_addr}")}))
            }
        }),
    );
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(http_listener, app).await;
    });

    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "websocket",
            "protocol": "slack",
            "appToken": "xapp-test",
            "gatewayUrl": format!("http://{http_addr}/api/apps.connections.open"),
        })))
        .expect("slack ingestor builds");
    ingestor.start().await.expect("starts");

    let ack = tokio::time::timeout(Duration::from_secs(5), ack_rx.recv())
        .await
        .expect("ack arrives")
        .unwrap();
    assert_eq!(ack["envelope_id"], json!("e-1"));

    let core = ingestor.core();
    wait_for("buffered envelope", Duration::from_secs(5), || {
        !core.get_events(None).is_empty()
    })
    .await;
    let events = core.get_events(None);
    assert_eq!(events[0].event_type, "events_api");
    assert_eq!(events[0].idempotency_key, "slack:conn:e-1");
    assert_eq!(open_calls.load(Ordering::SeqCst), 1);

    ingestor.stop().await;
}

#[tokio::test]
async fn poll_extracts_items_and_deduplicates() {
    let app = Router::new().route(
        "/feed",
        get(|| async {
            Json(json!({
                "items": [
                    {"id": "a", "value": 1},
                    {"id": "b", "value": 2},
                    {"id": "a", "value": 1},
                ]
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "poll",
            "url": format!("http://{addr}/feed"),
            "intervalMs": 60_000,
            "responsePath": "items",
            "deduplicateBy": "id",
            "eventType": "feed_item",
        })))
        .expect("poll ingestor builds");
    ingestor.start().await.expect("starts");

    let core = ingestor.core();
    wait_for("first poll", Duration::from_secs(5), || {
        core.get_events(None).len() >= 2
    })
    .await;

    let events = core.get_events(None);
    // The duplicated "a" item was dropped by the field dedup.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "feed_item");
    assert_eq!(core.state(), IngestorState::Connected);

    ingestor.stop().await;
    assert_eq!(core.state(), IngestorState::Stopped);
}

#[tokio::test]
async fn poll_upstream_failure_backs_off_to_reconnecting() {
    // Nothing listens here: every poll fails.
    let registry = IngestorRegistry::with_builtin();
    let ingestor = registry
        .create(spawn_ctx(json!({
            "type": "poll",
            "url": "http://127.0.0.1:9/unreachable",
            "intervalMs": 60_000,
        })))
        .expect("poll ingestor builds");
    ingestor.start().await.expect("starts");

    let core = ingestor.core();
    wait_for("reconnecting state", Duration::from_secs(5), || {
        core.state() == IngestorState::Reconnecting
    })
    .await;

    ingestor.stop().await;
}
