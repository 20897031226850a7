//! End-to-end scenarios against `SyncServer`: in-process through the
//! outbound queues, and over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use pixel_canvas::network::protocol::{PlaceFailReason, PlaceRequest};
use pixel_canvas::network::{AccountStore, ClientMessage, ConnectionId, ErrorCode, Outbound, ServerMessage};
use pixel_canvas::persist::PersistConfig;
use pixel_canvas::{Color, Identity, MemoryAccounts, RegenPolicy, ServerConfig, SyncServer};

fn accounts(names: &[&str]) -> Arc<dyn AccountStore> {
    Arc::new(MemoryAccounts::with_identities(
        names.iter().map(|n| Identity::new(n).unwrap()),
    ))
}

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.canvas.width = 200;
    config.canvas.height = 200;
    config.canvas.chunk_size = 50;
    config
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Some(msg) = item.decode() {
            out.push(msg);
        }
    }
    out
}

fn place(x: i64, y: i64, color: &str) -> ClientMessage {
    ClientMessage::Place(PlaceRequest {
        x,
        y,
        color: color.to_string(),
    })
}

async fn join(server: &SyncServer, identity: Option<&str>) -> (ConnectionId, mpsc::Receiver<Outbound>) {
    let (id, mut rx) = server.connect(None, identity).await;
    drain(&mut rx);
    (id, rx)
}

fn points_updates(messages: &[ServerMessage]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::PointsUpdate { points } => Some(*points),
            _ => None,
        })
        .collect()
}

// =============================================================================
// RATE LIMITING
// =============================================================================

#[tokio::test]
async fn test_alice_spends_six_then_cools_down() {
    let server = SyncServer::new(config(), accounts(&["alice"]));
    let (id, mut rx) = join(&server, Some("alice")).await;

    let mut balances = Vec::new();
    for i in 0..6 {
        server.handle_message(id, place(i, 0, "#ff0000")).await;
        balances.extend(points_updates(&drain(&mut rx)));
    }
    assert_eq!(balances, vec![5, 4, 3, 2, 1, 0]);

    server.handle_message(id, place(10, 10, "#00ff00")).await;
    match &drain(&mut rx)[..] {
        [ServerMessage::PlaceFailed(failure)] => {
            assert_eq!(failure.reason, PlaceFailReason::Cooldown);
            assert_eq!(failure.wait, Some(20));
        }
        other => panic!("expected cooldown rejection, got {:?}", other),
    }
    assert_eq!(server.canvas().read().await.get(10, 10), None);
}

#[tokio::test]
async fn test_full_refill_after_cooldown() {
    let mut config = config();
    config.limits.cooldown = Duration::from_millis(100);
    let server = SyncServer::new(config, accounts(&["alice"]));
    let (id, mut rx) = join(&server, Some("alice")).await;

    for i in 0..6 {
        server.handle_message(id, place(i, 1, "#123456")).await;
    }
    let messages = drain(&mut rx);
    assert!(messages.contains(&ServerMessage::CooldownStarted { wait: 1 }));

    tokio::time::sleep(Duration::from_millis(150)).await;
    server.handle_message(id, place(7, 1, "#123456")).await;
    assert_eq!(points_updates(&drain(&mut rx)), vec![5]);
}

#[tokio::test]
async fn test_incremental_regains_one_point() {
    let mut config = config();
    config.limits.cooldown = Duration::from_millis(200);
    config.limits.policy = RegenPolicy::Incremental;
    let server = SyncServer::new(config, accounts(&["alice"]));
    let (id, mut rx) = join(&server, Some("alice")).await;

    for i in 0..6 {
        server.handle_message(id, place(i, 2, "#abcdef")).await;
    }
    drain(&mut rx);

    tokio::time::sleep(Duration::from_millis(300)).await;
    server.handle_message(id, place(9, 2, "#abcdef")).await;
    assert_eq!(points_updates(&drain(&mut rx)), vec![0]);

    server.handle_message(id, place(10, 2, "#abcdef")).await;
    assert!(matches!(
        drain(&mut rx)[..],
        [ServerMessage::PlaceFailed(ref failure)] if failure.reason == PlaceFailReason::Cooldown
    ));
}

#[tokio::test]
async fn test_bob_shares_balance_across_connections() {
    let server = SyncServer::new(config(), accounts(&["bob"]));
    let (a, mut rx_a) = join(&server, Some("bob")).await;
    let (_b, mut rx_b) = join(&server, Some("bob")).await;
    drain(&mut rx_a);

    server.handle_message(a, place(3, 3, "#000")).await;

    let seen_by_b = drain(&mut rx_b);
    assert!(seen_by_b.contains(&ServerMessage::Pixel(pixel_canvas::network::PixelUpdate {
        x: 3,
        y: 3,
        color: "#000000".into(),
    })));
    assert_eq!(points_updates(&seen_by_b), vec![5]);
    assert_eq!(points_updates(&drain(&mut rx_a)), vec![5]);
    assert_eq!(server.points(&Identity::new("bob").unwrap()).await, 5);
    assert_eq!(server.online_count().await, 1);
    assert_eq!(server.connection_count().await, 2);
}

// =============================================================================
// BROADCAST
// =============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let server = SyncServer::new(config(), accounts(&["alice"]));
    let (placer, mut placer_rx) = join(&server, Some("alice")).await;
    let mut watchers = Vec::new();
    for _ in 0..5 {
        watchers.push(join(&server, None).await);
    }

    server.handle_message(placer, place(42, 17, "#FACADE")).await;

    let expected = ServerMessage::Pixel(pixel_canvas::network::PixelUpdate {
        x: 42,
        y: 17,
        color: "#facade".into(),
    });
    assert_eq!(drain(&mut placer_rx)[0], expected);
    for (_, rx) in watchers.iter_mut() {
        assert_eq!(drain(rx), vec![expected.clone()]);
    }
}

#[tokio::test]
async fn test_last_write_wins_in_broadcast_order() {
    let server = SyncServer::new(config(), accounts(&["alice", "bob"]));
    let (alice, _alice_rx) = join(&server, Some("alice")).await;
    let (bob, _bob_rx) = join(&server, Some("bob")).await;
    let (_, mut watcher) = join(&server, None).await;

    server.handle_message(alice, place(5, 5, "#111111")).await;
    server.handle_message(bob, place(5, 5, "#222222")).await;

    let colors: Vec<String> = drain(&mut watcher)
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::Pixel(p) => Some(p.color),
            _ => None,
        })
        .collect();
    assert_eq!(colors, vec!["#111111", "#222222"]);
    assert_eq!(server.canvas().read().await.get(5, 5), Some(Color::from_rgb(0x222222)));
}

#[tokio::test]
async fn test_slow_connection_evicted_on_overflow() {
    let mut config = config();
    config.outbound_queue = 2;
    let server = SyncServer::new(config, accounts(&["alice"]));
    let (placer, mut placer_rx) = join(&server, Some("alice")).await;

    // Never drained: holds init, then the first pixel fills it.
    let (slow, _slow_rx) = server.connect(None, None).await;

    server.handle_message(placer, place(0, 0, "#fff")).await;
    drain(&mut placer_rx);
    assert!(server.registry().contains(slow).await);

    server.handle_message(placer, place(1, 0, "#fff")).await;
    drain(&mut placer_rx);
    assert!(!server.registry().contains(slow).await);
    assert!(server.registry().contains(placer).await);
}

// =============================================================================
// CHAT
// =============================================================================

#[tokio::test]
async fn test_chat_retention_in_init() {
    let server = SyncServer::new(config(), accounts(&["carol"]));
    let (carol, mut rx) = join(&server, Some("carol")).await;

    for i in 0..60 {
        server
            .handle_message(carol, ClientMessage::Chat { text: format!("msg {}", i) })
            .await;
    }
    assert_eq!(drain(&mut rx).len(), 60);

    let (_, mut late) = server.connect(None, None).await;
    match &drain(&mut late)[0] {
        ServerMessage::Init(init) => {
            assert_eq!(init.chat.len(), 50);
            assert_eq!(init.chat[0].text, "msg 10");
            assert_eq!(init.chat[49].text, "msg 59");
        }
        other => panic!("expected init, got {:?}", other),
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.persistence = PersistConfig {
        data_dir: Some(dir.path().to_path_buf()),
        flush_interval: Duration::from_secs(60),
    };

    {
        let server = SyncServer::open(config.clone(), accounts(&["alice"])).await.unwrap();
        let (id, _rx) = join(&server, Some("alice")).await;
        server.handle_message(id, place(12, 34, "#0a0b0c")).await;
        server
            .handle_message(id, ClientMessage::Chat { text: "still here".into() })
            .await;

        assert!(server.flush().await.unwrap());
        assert!(!server.flush().await.unwrap());
    }

    let server = SyncServer::open(config, accounts(&["alice"])).await.unwrap();
    let (_, mut rx) = server.connect(None, None).await;
    match &drain(&mut rx)[0] {
        ServerMessage::Init(init) => {
            let cells: Vec<_> = init.pixels.iter().flat_map(|c| c.cells.iter()).collect();
            assert_eq!(cells.len(), 1);
            assert_eq!((cells[0].x, cells[0].y), (12, 34));
            assert_eq!(cells[0].color, "#0a0b0c");
            assert_eq!(init.chat.len(), 1);
            assert_eq!(init.chat[0].text, "still here");
        }
        other => panic!("expected init, got {:?}", other),
    }
    assert!(!server.flush().await.unwrap());
}

// =============================================================================
// WEBSOCKET
// =============================================================================

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start() -> (SyncServer, SocketAddr) {
    start_with(config()).await
}

async fn start_with(mut config: ServerConfig) -> (SyncServer, SocketAddr) {
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    let server = SyncServer::new(config, accounts(&["alice"]));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

async fn next_message(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::from_json(&text).unwrap();
        }
    }
}

async fn wait_for<F>(ws: &mut Client, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let message = next_message(ws).await;
        if pred(&message) {
            return message;
        }
    }
}

#[tokio::test]
async fn test_websocket_session() {
    let (server, addr) = start().await;

    let (mut ws, _) = connect_async(format!("ws://{}/?identity=alice", addr)).await.unwrap();
    match next_message(&mut ws).await {
        ServerMessage::Init(init) => {
            assert_eq!(init.identity.as_deref(), Some("alice"));
            assert_eq!(init.points, Some(6));
            assert_eq!((init.width, init.height), (200, 200));
        }
        other => panic!("expected init, got {:?}", other),
    }

    ws.send(Message::Text("garbage".into())).await.unwrap();
    let error = wait_for(&mut ws, |m| matches!(m, ServerMessage::Error(_))).await;
    assert!(matches!(error, ServerMessage::Error(_)));

    ws.send(Message::Text(r##"{"type":"drawPixel","x":7,"y":8,"color":"#0F0"}"##.into()))
        .await
        .unwrap();
    let pixel = wait_for(&mut ws, |m| matches!(m, ServerMessage::Pixel(_))).await;
    assert_eq!(
        pixel,
        ServerMessage::Pixel(pixel_canvas::network::PixelUpdate {
            x: 7,
            y: 8,
            color: "#00ff00".into(),
        })
    );
    let points = wait_for(&mut ws, |m| matches!(m, ServerMessage::PointsUpdate { .. })).await;
    assert_eq!(points, ServerMessage::PointsUpdate { points: 5 });

    server.shutdown();
    let shutdown = wait_for(&mut ws, |m| matches!(m, ServerMessage::Shutdown { .. })).await;
    assert!(matches!(shutdown, ServerMessage::Shutdown { .. }));
}

#[tokio::test]
async fn test_websocket_anonymous_sees_other_placements() {
    let (server, addr) = start().await;

    let (mut watcher, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    assert!(matches!(next_message(&mut watcher).await, ServerMessage::Init(_)));

    let (mut alice, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    assert!(matches!(next_message(&mut alice).await, ServerMessage::Init(_)));
    alice
        .send(Message::Text(r#"{"type":"login","identity":"alice"}"#.into()))
        .await
        .unwrap();
    let login = wait_for(&mut alice, |m| matches!(m, ServerMessage::LoginSuccess { .. })).await;
    assert_eq!(
        login,
        ServerMessage::LoginSuccess {
            identity: "alice".into(),
            points: 6
        }
    );

    let presence = wait_for(&mut watcher, |m| matches!(m, ServerMessage::Presence { .. })).await;
    assert_eq!(presence, ServerMessage::Presence { online: 1 });

    alice
        .send(Message::Text(r##"{"type":"place","x":1,"y":1,"color":"#fff"}"##.into()))
        .await
        .unwrap();
    let pixel = wait_for(&mut watcher, |m| matches!(m, ServerMessage::Pixel(_))).await;
    assert!(matches!(pixel, ServerMessage::Pixel(ref p) if p.x == 1 && p.y == 1));

    alice.close(None).await.unwrap();
    let presence = wait_for(&mut watcher, |m| matches!(m, ServerMessage::Presence { .. })).await;
    assert_eq!(presence, ServerMessage::Presence { online: 0 });

    server.shutdown();
}

#[tokio::test]
async fn test_websocket_connection_cap() {
    let mut config = config();
    config.max_connections = 1;
    let (server, addr) = start_with(config).await;

    let (mut first, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    assert!(matches!(next_message(&mut first).await, ServerMessage::Init(_)));

    let (mut second, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    match next_message(&mut second).await {
        ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::ServerOverloaded),
        other => panic!("expected overload error, got {:?}", other),
    }
    assert_eq!(server.connection_count().await, 1);

    server.shutdown();
}
