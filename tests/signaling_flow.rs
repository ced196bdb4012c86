// End-to-end signaling scenarios against a real server on a loopback port

use castrelay::config::ServerConfig;
use castrelay::metrics::ServerMetrics;
use castrelay::signaling::SignalingServer;
use castrelay::transcode::TranscodeConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    _hls_root: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

async fn start_server_with(tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let hls_root = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        transcode: TranscodeConfig {
            program: "/nonexistent/castrelay-transcoder".into(),
            hls_root: hls_root.path().to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    };
    tweak(&mut config);
    let server = SignalingServer::new(config, ServerMetrics::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_on(listener));
    TestServer {
        addr,
        _hls_root: hls_root,
    }
}

async fn connect(server: &TestServer) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", server.addr)).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame, skipping control frames.
async fn next_text(socket: &mut Socket) -> String {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    serde_json::from_str(&next_text(socket).await).unwrap()
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn create_room(socket: &mut Socket, code: &str) {
    let now = now_millis();
    send(
        socket,
        json!({"type": "create-room", "roomCode": code, "createdAt": now, "expiresAt": now + 20_000}),
    )
    .await;
    let reply = next_json(socket).await;
    assert_eq!(reply["type"], "room-created");
    assert_eq!(reply["roomCode"], code.to_uppercase());
}

/// Presenter creates `code`, viewer joins it; both queues are left empty.
async fn paired(server: &TestServer, code: &str) -> (Socket, Socket) {
    let mut presenter = connect(server).await;
    let mut viewer = connect(server).await;
    create_room(&mut presenter, code).await;
    send(&mut viewer, json!({"type": "join-room", "roomCode": code})).await;
    assert_eq!(next_json(&mut viewer).await["type"], "room-joined");
    assert_eq!(next_json(&mut presenter).await["type"], "peer-joined");
    (presenter, viewer)
}

#[tokio::test]
async fn test_create_join_and_relay_offer() {
    let server = start_server().await;
    let mut presenter = connect(&server).await;
    let mut viewer = connect(&server).await;

    create_room(&mut presenter, "ABC123").await;

    send(&mut viewer, json!({"type": "join-room", "roomCode": "XYZ999"})).await;
    let reply = next_json(&mut viewer).await;
    assert_eq!(reply["type"], "room-not-found");
    assert_eq!(reply["roomCode"], "XYZ999");

    send(&mut viewer, json!({"type": "join-room", "roomCode": "abc123"})).await;
    let reply = next_json(&mut viewer).await;
    assert_eq!(reply, json!({"type": "room-joined", "roomCode": "ABC123", "peerReady": true}));

    let joined = next_json(&mut presenter).await;
    assert_eq!(joined, json!({"type": "peer-joined", "role": "viewer"}));

    let offer = r#"{"type":"offer","sdp":"v=0\r\no=- 46117 2 IN IP4 127.0.0.1"}"#;
    presenter.send(Message::text(offer)).await.unwrap();
    assert_eq!(next_text(&mut viewer).await, offer);

    let candidate = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 UDP 1 10.0.0.1 9 typ host","sdpMid":"0"}}"#;
    viewer.send(Message::text(candidate)).await.unwrap();
    assert_eq!(next_text(&mut presenter).await, candidate);
}

#[tokio::test]
async fn test_room_admits_one_viewer() {
    let server = start_server().await;
    let (_presenter, _viewer) = paired(&server, "ONE111").await;

    let mut late = connect(&server).await;
    send(&mut late, json!({"type": "join-room", "roomCode": "ONE111"})).await;
    let reply = next_json(&mut late).await;
    assert_eq!(reply["type"], "room-already-used");
    assert_eq!(reply["roomCode"], "ONE111");
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    let server = start_server().await;
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;
    create_room(&mut first, "DUP123").await;

    let now = now_millis();
    send(
        &mut second,
        json!({"type": "create-room", "roomCode": "DUP123", "createdAt": now, "expiresAt": now + 20_000}),
    )
    .await;
    let reply = next_json(&mut second).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "ROOM_ALREADY_EXISTS");
}

#[tokio::test]
async fn test_leave_closes_room() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "BYE123").await;

    send(&mut presenter, json!({"type": "leave"})).await;
    assert_eq!(next_json(&mut presenter).await["type"], "left");
    assert_eq!(next_json(&mut viewer).await["type"], "room_closed");

    // Leaving again is a no-op; relaying now fails
    send(&mut viewer, json!({"type": "leave"})).await;
    send(&mut viewer, json!({"type": "answer", "sdp": "v=0"})).await;
    let reply = next_json(&mut viewer).await;
    assert_eq!(reply["code"], "PROTOCOL_VIOLATION");

    let mut late = connect(&server).await;
    send(&mut late, json!({"type": "join-room", "roomCode": "BYE123"})).await;
    assert_eq!(next_json(&mut late).await["type"], "room-not-found");
}

#[tokio::test]
async fn test_disconnect_notifies_peer() {
    let server = start_server().await;
    let (mut presenter, viewer) = paired(&server, "DIS123").await;

    drop(viewer);
    let reply = next_json(&mut presenter).await;
    assert_eq!(reply, json!({"type": "peer-left", "role": "viewer"}));

    send(&mut presenter, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut presenter).await["code"], "PEER_UNAVAILABLE");
}

#[tokio::test]
async fn test_failed_join_keeps_presenter_slot() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "PRB111").await;

    send(&mut presenter, json!({"type": "join-room", "roomCode": "XYZ999"})).await;
    assert_eq!(next_json(&mut presenter).await["type"], "room-not-found");

    send(&mut viewer, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut presenter).await, json!({"type": "offer", "sdp": "v=0"}));
    send(&mut presenter, json!({"type": "answer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut viewer).await["type"], "answer");
}

#[tokio::test]
async fn test_failed_create_keeps_viewer_slot() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "PRB222").await;

    let now = now_millis();
    send(
        &mut viewer,
        json!({"type": "create-room", "roomCode": "PRB222", "createdAt": now, "expiresAt": now + 20_000}),
    )
    .await;
    assert_eq!(next_json(&mut viewer).await["code"], "ROOM_ALREADY_EXISTS");

    send(&mut presenter, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut viewer).await["type"], "offer");
    send(&mut viewer, json!({"type": "answer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut presenter).await, json!({"type": "answer", "sdp": "v=0"}));
}

#[tokio::test]
async fn test_media_sender_counts_as_alive() {
    let server = start_server_with(|config| {
        config.heartbeat_interval = Duration::from_secs(1);
    })
    .await;
    let mut presenter = connect(&server).await;
    create_room(&mut presenter, "LIV123").await;

    // Never reads, so no pong goes back while chunks keep flowing
    for _ in 0..18 {
        presenter.send(Message::binary(vec![0u8; 64])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    send(&mut presenter, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut presenter).await["code"], "PEER_UNAVAILABLE");
}

#[tokio::test]
async fn test_command_is_rewrapped() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "CMD123").await;

    send(&mut viewer, json!({"type": "command", "command": "flip-camera", "data": {"facing": "rear"}})).await;
    let relayed = next_json(&mut presenter).await;
    assert_eq!(
        relayed,
        json!({"type": "cmd", "cmd": "flip-camera", "payload": {"facing": "rear"}})
    );

    send(&mut presenter, json!({"type": "countdown-start", "seconds": 3})).await;
    let relayed = next_json(&mut viewer).await;
    assert_eq!(relayed["type"], "countdown-start");
    assert_eq!(relayed["seconds"], 3);
}

#[tokio::test]
async fn test_start_stream_with_missing_transcoder() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "STR123").await;

    // Only the viewer controls the stream
    send(&mut presenter, json!({"type": "start-stream"})).await;
    assert_eq!(next_json(&mut presenter).await["code"], "ROLE_NOT_ALLOWED");

    send(&mut viewer, json!({"type": "start-stream"})).await;
    assert_eq!(next_json(&mut presenter).await["type"], "start-stream");

    let error = next_json(&mut presenter).await;
    assert_eq!(error["type"], "stream_error");
    assert_eq!(error["roomCode"], "STR123");

    let error = next_json(&mut viewer).await;
    assert_eq!(error["type"], "stream_error");
    assert_eq!(error["roomCode"], "STR123");
}

#[tokio::test]
async fn test_stop_stream_notifies_both() {
    let server = start_server().await;
    let (mut presenter, mut viewer) = paired(&server, "STP123").await;

    send(&mut viewer, json!({"type": "stop-stream"})).await;
    assert_eq!(next_json(&mut presenter).await["type"], "stop-stream");

    // Nothing was running, so no stream_stopped follows; the next frame is the relayed offer
    send(&mut viewer, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut presenter).await["type"], "offer");
}

#[tokio::test]
async fn test_rejects_bad_frames() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    socket.send(Message::text("{not json")).await.unwrap();
    assert_eq!(next_json(&mut socket).await["code"], "MALFORMED_MESSAGE");

    send(&mut socket, json!({"type": "teleport"})).await;
    assert_eq!(next_json(&mut socket).await["code"], "UNKNOWN_TYPE");

    send(&mut socket, json!({"type": "join-room"})).await;
    assert_eq!(next_json(&mut socket).await["code"], "MALFORMED_MESSAGE");

    send(&mut socket, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut socket).await["code"], "PROTOCOL_VIOLATION");

    // Errors never close the channel
    create_room(&mut socket, "OKK123").await;
}

#[tokio::test]
async fn test_media_from_viewer_is_rejected_once() {
    let server = start_server().await;
    let (_presenter, mut viewer) = paired(&server, "MED123").await;

    viewer.send(Message::binary(vec![0u8; 16])).await.unwrap();
    viewer.send(Message::binary(vec![0u8; 16])).await.unwrap();
    assert_eq!(next_json(&mut viewer).await["code"], "ROLE_NOT_ALLOWED");

    send(&mut viewer, json!({"type": "answer", "sdp": "v=0"})).await;
    // The second chunk produced no further error
    send(&mut viewer, json!({"type": "teleport"})).await;
    assert_eq!(next_json(&mut viewer).await["code"], "UNKNOWN_TYPE");
}

#[tokio::test]
async fn test_legacy_join_displaces_previous_holder() {
    let server = start_server().await;
    let mut first = connect(&server).await;
    let mut web = connect(&server).await;
    let mut second = connect(&server).await;

    send(&mut first, json!({"type": "join", "sessionId": "legacy-42", "role": "mobile"})).await;
    let reply = next_json(&mut first).await;
    assert_eq!(
        reply,
        json!({"type": "joined", "sessionId": "LEGACY-42", "role": "presenter", "peerReady": false})
    );

    send(&mut web, json!({"type": "join", "sessionId": "legacy-42", "role": "web"})).await;
    assert_eq!(next_json(&mut web).await["peerReady"], true);
    assert_eq!(next_json(&mut first).await["type"], "peer-joined");

    send(&mut second, json!({"type": "join", "sessionId": "legacy-42", "role": "presenter"})).await;
    assert_eq!(next_json(&mut second).await["type"], "joined");

    let error = next_json(&mut first).await;
    assert_eq!(error["code"], "REPLACED");
    let frame = timeout(WAIT, first.next()).await.unwrap().unwrap().unwrap();
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4001),
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(next_json(&mut web).await, json!({"type": "peer-joined", "role": "presenter"}));
    send(&mut web, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(next_json(&mut second).await["type"], "offer");
}

async fn http_get(server: &TestServer, path: &str) -> String {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

async fn http_post(server: &TestServer, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_viewer_beacons_need_a_known_room() {
    let server = start_server().await;
    let join = r#"{"action":"join"}"#;

    for code in ["NOROOM1", "NOROOM2", "NOROOM3"] {
        let response = http_post(&server, &format!("/api/streams/{code}/viewers"), join).await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    }

    let mut presenter = connect(&server).await;
    create_room(&mut presenter, "BCN123").await;
    let response = http_post(&server, "/api/streams/bcn123/viewers", join).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""viewers":1"#), "{response}");
    assert!(response.contains(r#""streaming":false"#), "{response}");
}

#[tokio::test]
async fn test_http_room_info_and_health() {
    let server = start_server().await;
    let mut presenter = connect(&server).await;
    create_room(&mut presenter, "WEB123").await;

    let response = http_get(&server, "/api/rooms/web123").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""roomCode":"WEB123""#));
    assert!(response.contains(r#""presenterConnected":true"#));

    let response = http_get(&server, "/api/rooms/NOPE00").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let response = http_get(&server, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""rooms":1"#));
}
