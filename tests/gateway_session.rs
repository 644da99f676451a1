//! End-to-end sessions against a scripted local gateway.

use futures_util::{SinkExt, StreamExt};
use gateway_shard_core::{
    Compression, ConnectionConfig, Error, EventSink, FleetConfig, GatewayFrame, GatewayInfo, HeartbeatConfig,
    IdentifyConfig, InMemorySessionStore, LifecycleEvent, OpCode, ShardFleet,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Observed {
    Dispatch(String),
    Lifecycle(LifecycleEvent),
    FleetReady,
}

struct Recorder {
    tx: mpsc::UnboundedSender<(u32, Observed)>,
}

impl EventSink for Recorder {
    async fn on_dispatch(&self, shard_id: u32, event: &str, _payload: Value) {
        let _ = self.tx.send((shard_id, Observed::Dispatch(event.to_string())));
    }

    async fn on_lifecycle(&self, shard_id: u32, event: &LifecycleEvent) {
        let _ = self.tx.send((shard_id, Observed::Lifecycle(event.clone())));
    }

    async fn on_fleet_ready(&self) {
        let _ = self.tx.send((0, Observed::FleetReady));
    }
}

type Server = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Server {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut Server, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Read frames until one with `op` arrives, skipping heartbeats and anything else.
async fn recv_op(ws: &mut Server, op: u64) -> Value {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["op"] == op {
                return frame["d"].clone();
            }
        }
    }
}

/// Next text frame as JSON.
async fn recv_frame(ws: &mut Server) -> Value {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Keep reading so close handshakes complete, until the peer goes away.
async fn drain(mut ws: Server) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn hello(ws: &mut Server) {
    send_json(ws, json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })).await;
}

async fn ready(ws: &mut Server, seq: i64, resume_url: &str, guilds: &[&str]) {
    let guilds: Vec<Value> = guilds.iter().map(|id| json!({ "id": id, "unavailable": true })).collect();
    send_json(
        ws,
        json!({
            "op": 0,
            "s": seq,
            "t": "READY",
            "d": { "session_id": "abc", "resume_gateway_url": resume_url, "guilds": guilds },
        }),
    )
    .await;
}

async fn next_lifecycle(
    rx: &mut mpsc::UnboundedReceiver<(u32, Observed)>,
    matches: impl Fn(&LifecycleEvent) -> bool,
) -> LifecycleEvent {
    loop {
        let (_, observed) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        if let Observed::Lifecycle(event) = observed {
            if matches(&event) {
                return event;
            }
        }
    }
}

fn config() -> FleetConfig {
    FleetConfig::builder("test-token")
        .compression(Compression::None)
        .spawn_delay(Duration::ZERO)
        .heartbeat(HeartbeatConfig { jitter: false })
        .identify(IdentifyConfig {
            spacing: Duration::from_millis(50),
            ..Default::default()
        })
        .connection(ConnectionConfig {
            guild_ready_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .build()
        .unwrap()
}

async fn fleet(url: &str) -> (ShardFleet<InMemorySessionStore, Recorder>, mpsc::UnboundedReceiver<(u32, Observed)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gateway = GatewayInfo {
        url: url.to_string(),
        shard_count: 1,
        max_concurrency: 1,
    };
    let fleet = ShardFleet::new(config(), &gateway, InMemorySessionStore::new(), Recorder { tx })
        .await
        .unwrap();
    (fleet, rx)
}

#[tokio::test]
async fn test_identify_ready_and_guild_streaming() {
    let (listener, url) = listen().await;
    let resume_url = url.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello(&mut ws).await;

        let identify = recv_op(&mut ws, 2).await;
        assert_eq!(identify["token"], "test-token");
        assert_eq!(identify["shard"], json!([0, 1]));

        ready(&mut ws, 1, &resume_url, &["1", "2"]).await;
        for (seq, id) in [(2, "1"), (3, "2")] {
            send_json(&mut ws, json!({ "op": 0, "s": seq, "t": "GUILD_CREATE", "d": { "id": id } })).await;
        }

        // READY forces an immediate heartbeat carrying the latest sequence
        let beat = recv_op(&mut ws, 1).await;
        assert!(beat.as_i64().unwrap() >= 1);
        send_json(&mut ws, json!({ "op": 11 })).await;
        drain(ws).await;
    });

    let (fleet, mut rx) = fleet(&url).await;
    fleet.spawn_all().await.unwrap();
    fleet.connect_all().await.unwrap();

    let event = next_lifecycle(&mut rx, |e| matches!(e, LifecycleEvent::AllReady { .. })).await;
    assert_eq!(event, LifecycleEvent::AllReady { unavailable: None });

    let (_, observed) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(observed, Observed::FleetReady));
    assert!(fleet.is_ready());
    assert_eq!(fleet.metrics().identifies(), 1);

    fleet.destroy_all().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_request_resumes_session() {
    let (listener, url) = listen().await;
    let resume_url = url.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        recv_op(&mut ws, 2).await;
        ready(&mut ws, 1, &resume_url, &[]).await;
        send_json(&mut ws, json!({ "op": 0, "s": 5, "t": "MESSAGE_CREATE", "d": { "content": "hi" } })).await;
        send_json(&mut ws, json!({ "op": 7, "d": null })).await;
        drain(ws).await;

        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        let resume = recv_op(&mut ws, 6).await;
        assert_eq!(resume["session_id"], "abc");
        assert_eq!(resume["seq"], 5);
        assert_eq!(resume["token"], "test-token");
        send_json(&mut ws, json!({ "op": 0, "s": 6, "t": "RESUMED", "d": {} })).await;
        drain(ws).await;
    });

    let (fleet, mut rx) = fleet(&url).await;
    fleet.spawn_all().await.unwrap();
    fleet.connect_all().await.unwrap();

    let close = next_lifecycle(&mut rx, |e| matches!(e, LifecycleEvent::Close(_))).await;
    assert!(matches!(close, LifecycleEvent::Close(ref c) if c.code == 4000));
    next_lifecycle(&mut rx, |e| matches!(e, LifecycleEvent::Resumed { .. })).await;

    let metrics = fleet.metrics();
    assert_eq!(metrics.identifies(), 1);
    assert_eq!(metrics.resumes(), 1);

    fleet.destroy_all().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        recv_op(&mut ws, 2).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed".into(),
        }))
        .await
        .unwrap();
        drain(ws).await;
    });

    let (fleet, _rx) = fleet(&url).await;
    fleet.spawn_all().await.unwrap();

    let err = fleet.connect_all().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::FatalClose { code: 4004, .. }));

    timeout(WAIT, async {
        while fleet.fatal_shards().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(fleet.fatal_shards(), vec![0]);
    assert_eq!(fleet.metrics().fatal_closes(), 1);

    server.await.unwrap();
}

#[tokio::test]
async fn test_respawn_recovers_fatal_shard() {
    let (listener, url) = listen().await;
    let resume_url = url.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        recv_op(&mut ws, 2).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed".into(),
        }))
        .await
        .unwrap();
        drain(ws).await;

        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        let identify = recv_op(&mut ws, 2).await;
        assert_eq!(identify["token"], "test-token");
        ready(&mut ws, 1, &resume_url, &[]).await;
        drain(ws).await;
    });

    let (fleet, mut rx) = fleet(&url).await;
    fleet.spawn_all().await.unwrap();
    assert!(fleet.connect_all().await.is_err());

    timeout(WAIT, async {
        while fleet.fatal_shards().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    timeout(WAIT, fleet.respawn(0)).await.unwrap().unwrap();
    assert!(fleet.fatal_shards().is_empty());
    next_lifecycle(&mut rx, |e| matches!(e, LifecycleEvent::AllReady { .. })).await;
    assert_eq!(fleet.metrics().identifies(), 2);

    fleet.destroy_all().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_control_frames_bypass_held_application_frames() {
    let (listener, url) = listen().await;
    let resume_url = url.clone();
    let (hello_tx, hello_rx) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello(&mut ws).await;
        let _ = hello_tx.send(());

        // The presence update waits for READY; IDENTIFY goes first
        let first = recv_frame(&mut ws).await;
        assert_eq!(first["op"], 2);
        ready(&mut ws, 1, &resume_url, &[]).await;

        let mut ops = Vec::new();
        while ops.len() < 2 {
            ops.push(recv_frame(&mut ws).await["op"].as_u64().unwrap());
        }
        assert_eq!(ops, vec![1, 3]);
        drain(ws).await;
    });

    let (fleet, _rx) = fleet(&url).await;
    fleet.spawn_all().await.unwrap();
    let connect = async {
        fleet.connect_all().await.unwrap();
    };
    let send = async {
        hello_rx.await.unwrap();
        fleet
            .send(0, GatewayFrame::new(OpCode::PresenceUpdate, json!({ "status": "idle" })))
            .await
            .unwrap();
    };
    timeout(WAIT, futures_util::future::join(connect, send)).await.unwrap();

    fleet.destroy_all().await.unwrap();
    server.await.unwrap();
}
