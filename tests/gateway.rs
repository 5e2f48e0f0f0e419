//! Runs the manager against a local gateway stub

use futures_util::{SinkExt, StreamExt};
use gateway_shards::{ShardEvent, ShardManager, ShardManagerConfig, StaticGateway};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(10);

type ServerSocket = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client connects")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn send(ws: &mut ServerSocket, payload: Value) {
    ws.send(Message::Text(payload.to_string())).await.unwrap();
}

/// Next frame with the given op, skipping heartbeats
async fn expect_op(ws: &mut ServerSocket, op: u64) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("frame arrives")
            .expect("stream open")
            .unwrap();
        let Message::Text(text) = message else {
            continue;
        };
        let payload: Value = serde_json::from_str(&text).unwrap();
        if payload["op"] == op {
            return payload;
        }
        assert_eq!(payload["op"], 1, "unexpected frame {}", payload);
    }
}

async fn expect_event(events: &mut mpsc::Receiver<ShardEvent>, wanted: impl Fn(&ShardEvent) -> bool) -> ShardEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event arrives")
            .expect("channel open");
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_identify_ready_then_resume() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let config = ShardManagerConfig::builder().token("Bot secret").build().unwrap();
    let manager = ShardManager::new(config, StaticGateway::new(url.clone()).with_shards(1));
    let mut events = manager.take_events().unwrap();
    manager.start().await.unwrap();

    // Fresh session
    let mut ws = accept(&listener).await;
    send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], "Bot secret");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));

    send(
        &mut ws,
        json!({
            "op": 0,
            "s": 1,
            "t": "READY",
            "d": {"session_id": "abc", "resume_gateway_url": url, "guilds": [], "user": {"id": "7"}}
        }),
    )
    .await;
    expect_event(&mut events, |e| matches!(e, ShardEvent::AllReady)).await;
    assert!(manager.is_ready());

    // Server drops us with a recoverable code; the session is resumed
    ws.close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "unknown error".into(),
    }))
    .await
    .unwrap();
    let event = expect_event(&mut events, |e| matches!(e, ShardEvent::Disconnect { .. })).await;
    assert!(matches!(event, ShardEvent::Disconnect { reconnecting: true, .. }));

    let mut ws = accept(&listener).await;
    send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 1);

    send(&mut ws, json!({"op": 0, "s": 2, "t": "RESUMED", "d": {}})).await;
    expect_event(&mut events, |e| matches!(e, ShardEvent::Resumed { shard_id: 0 })).await;

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.identifies_total, 1);
    assert_eq!(metrics.resumes_total, 1);

    manager.stop().await.unwrap();
    assert!(!manager.is_ready());
}

#[tokio::test]
async fn test_fatal_close_stops_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let config = ShardManagerConfig::builder().token("Bot bad").build().unwrap();
    let manager = ShardManager::new(config, StaticGateway::new(url).with_shards(1));
    let mut events = manager.take_events().unwrap();
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    send(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 2).await;
    ws.close(Some(CloseFrame {
        code: CloseCode::from(4004),
        reason: "Authentication failed".into(),
    }))
    .await
    .unwrap();

    let event = expect_event(&mut events, |e| matches!(e, ShardEvent::Error { .. })).await;
    let ShardEvent::Error { error, fatal, .. } = event else {
        unreachable!()
    };
    assert!(fatal);
    assert_eq!(error.code, Some(4004));

    let event = expect_event(&mut events, |e| matches!(e, ShardEvent::Disconnect { .. })).await;
    assert!(matches!(event, ShardEvent::Disconnect { reconnecting: false, .. }));

    manager.stop().await.unwrap();
}
