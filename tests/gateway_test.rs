// Gateway connection against an in-process websocket server

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use herald::config::Credentials;
use herald::event::{Event, EventBody};
use herald::gateway::{ConnectionState, GatewayConfig, GatewayConnection};
use herald::Error;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the fake gateway treats each connection.
#[derive(Clone, Copy)]
enum Script {
    /// READY on the first connection, but never acknowledge its heartbeats
    SilentFirstConnection,
    /// READY, then ask the client to reconnect
    ReconnectAfterReady,
    /// Close every handshake with this code
    CloseWith(u16),
    /// READY then drop the first session; every RESUME is closed with 4000
    RejectResumes,
    /// READY then INVALID_SESSION(false) on the first session
    InvalidateFirstSession,
}

struct FakeGateway {
    script: Script,
    connections: AtomicUsize,
    /// Every IDENTIFY or RESUME frame received, in order
    handshakes: Mutex<Vec<Value>>,
    url: Mutex<String>,
}

async fn spawn_gateway(script: Script) -> Arc<FakeGateway> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::new(FakeGateway {
        script,
        connections: AtomicUsize::new(0),
        handshakes: Mutex::new(Vec::new()),
        url: Mutex::new(format!("ws://{}", addr)),
    });

    let app = Router::new()
        .route("/", get(upgrade))
        .with_state(Arc::clone(&gateway));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    gateway
}

async fn upgrade(ws: WebSocketUpgrade, State(gateway): State<Arc<FakeGateway>>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, gateway))
}

async fn send(socket: &mut WebSocket, frame: Value) -> bool {
    socket.send(Message::Text(frame.to_string())).await.is_ok()
}

async fn close(socket: &mut WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "rejected".into(),
        })))
        .await;
}

async fn serve_connection(mut socket: WebSocket, gateway: Arc<FakeGateway>) {
    let n = gateway.connections.fetch_add(1, Ordering::SeqCst);
    if !send(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 100}})).await {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        match frame["op"].as_u64() {
            Some(1) => {
                let silent = matches!(gateway.script, Script::SilentFirstConnection) && n == 0;
                if !silent && !send(&mut socket, json!({"op": 11})).await {
                    return;
                }
            }
            Some(op @ (2 | 6)) => {
                let first_identify = {
                    let mut handshakes = gateway.handshakes.lock().unwrap();
                    let first = op == 2 && handshakes.iter().all(|f| f["op"] != 2);
                    handshakes.push(frame.clone());
                    first
                };
                let close_code = match gateway.script {
                    Script::CloseWith(code) => Some(code),
                    Script::RejectResumes if op == 6 => Some(4000),
                    _ => None,
                };
                if let Some(code) = close_code {
                    close(&mut socket, code).await;
                    return;
                }

                let reply = if op == 2 {
                    let url = gateway.url.lock().unwrap().clone();
                    json!({
                        "op": 0, "s": 1, "t": "READY",
                        "d": {
                            "session_id": "abc",
                            "resume_gateway_url": url,
                            "user": {"id": "7", "username": "herald", "bot": true},
                            "guilds": []
                        }
                    })
                } else {
                    json!({"op": 0, "s": 2, "t": "RESUMED", "d": null})
                };
                if !send(&mut socket, reply).await {
                    return;
                }

                match gateway.script {
                    Script::ReconnectAfterReady if op == 2 => {
                        let _ = send(&mut socket, json!({"op": 7, "d": null})).await;
                    }
                    Script::RejectResumes if first_identify => {
                        close(&mut socket, 4000).await;
                        return;
                    }
                    Script::InvalidateFirstSession if first_identify => {
                        let _ = send(&mut socket, json!({"op": 9, "d": false})).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

fn config_for(gateway: &FakeGateway) -> GatewayConfig {
    GatewayConfig {
        url: Some(gateway.url.lock().unwrap().clone()),
        max_reconnect_attempts: 2,
        max_resume_attempts: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        handshake_timeout_seconds: 5,
        ..Default::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sink closed")
}

/// A connection whose heartbeats go unanswered is resumed, not re-identified.
#[tokio::test]
async fn test_missed_heartbeat_ack_resumes_session() {
    let gateway = spawn_gateway(Script::SilentFirstConnection).await;
    let mut connection = GatewayConnection::new(config_for(&gateway), Credentials::new("tok"), None);

    let session = connection.connect().await.unwrap();
    assert_eq!(session.session_id.as_deref(), Some("abc"));
    assert_eq!(session.sequence, Some(1));

    let closer = connection.closer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { connection.run(&tx).await });

    assert!(matches!(next_event(&mut rx).await.body, EventBody::Ready(_)));
    let resumed = next_event(&mut rx).await;
    assert!(matches!(resumed.body, EventBody::Resumed));
    assert_eq!(resumed.sequence, 2);

    closer.close();
    task.await.unwrap().unwrap();

    let handshakes = gateway.handshakes.lock().unwrap();
    assert_eq!(handshakes.len(), 2);
    assert_eq!(handshakes[0]["op"], 2);
    assert_eq!(handshakes[0]["d"]["token"], "tok");
    assert_eq!(handshakes[1]["op"], 6);
    assert_eq!(handshakes[1]["d"]["session_id"], "abc");
    assert_eq!(handshakes[1]["d"]["seq"], 1);
}

/// Opcode 7 reconnects and resumes.
#[tokio::test]
async fn test_reconnect_request_resumes() {
    let gateway = spawn_gateway(Script::ReconnectAfterReady).await;
    let mut connection = GatewayConnection::new(config_for(&gateway), Credentials::new("tok"), None);
    let mut state = connection.state();

    connection.connect().await.unwrap();
    let closer = connection.closer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { connection.run(&tx).await });

    next_event(&mut rx).await;
    assert!(matches!(next_event(&mut rx).await.body, EventBody::Resumed));
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    closer.close();
    task.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Closed);
    assert_eq!(gateway.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_close_is_fatal() {
    let gateway = spawn_gateway(Script::CloseWith(4004)).await;
    let mut connection = GatewayConnection::new(config_for(&gateway), Credentials::new("bad"), None);

    let result = connection.connect().await;
    assert!(matches!(result, Err(Error::Auth(_))));
    assert_eq!(gateway.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded() {
    let gateway = spawn_gateway(Script::CloseWith(4000)).await;
    let mut connection = GatewayConnection::new(config_for(&gateway), Credentials::new("tok"), None);
    let (tx, _rx) = mpsc::unbounded_channel::<Event>();

    let result = tokio::time::timeout(Duration::from_secs(5), connection.run(&tx))
        .await
        .expect("run did not give up");

    match result {
        Err(Error::ConnectionLost { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
    assert_eq!(gateway.connections.load(Ordering::SeqCst), 2);
    // Nothing was ever resumable, so every attempt identified
    assert!(gateway
        .handshakes
        .lock()
        .unwrap()
        .iter()
        .all(|frame| frame["op"] == 2));
}

/// Resumes that keep failing fall back to a fresh IDENTIFY.
#[tokio::test]
async fn test_failed_resumes_fall_back_to_identify() {
    let gateway = spawn_gateway(Script::RejectResumes).await;
    let config = GatewayConfig {
        max_reconnect_attempts: 5,
        ..config_for(&gateway)
    };
    let mut connection = GatewayConnection::new(config, Credentials::new("tok"), None);

    connection.connect().await.unwrap();
    let closer = connection.closer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { connection.run(&tx).await });

    assert!(matches!(next_event(&mut rx).await.body, EventBody::Ready(_)));
    // The second READY only arrives after a new IDENTIFY
    assert!(matches!(next_event(&mut rx).await.body, EventBody::Ready(_)));

    closer.close();
    task.await.unwrap().unwrap();

    let ops: Vec<Value> = gateway
        .handshakes
        .lock()
        .unwrap()
        .iter()
        .map(|frame| frame["op"].clone())
        .collect();
    assert_eq!(ops, vec![json!(2), json!(6), json!(6), json!(2)]);
}

/// A non-resumable INVALID_SESSION starts over with IDENTIFY.
#[tokio::test]
async fn test_invalid_session_reidentifies() {
    let gateway = spawn_gateway(Script::InvalidateFirstSession).await;
    let mut connection = GatewayConnection::new(config_for(&gateway), Credentials::new("tok"), None);

    connection.connect().await.unwrap();
    let closer = connection.closer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { connection.run(&tx).await });

    assert!(matches!(next_event(&mut rx).await.body, EventBody::Ready(_)));
    assert!(matches!(next_event(&mut rx).await.body, EventBody::Ready(_)));

    closer.close();
    task.await.unwrap().unwrap();

    let handshakes = gateway.handshakes.lock().unwrap();
    assert_eq!(handshakes.len(), 2);
    assert!(handshakes.iter().all(|frame| frame["op"] == 2));
    assert_eq!(gateway.connections.load(Ordering::SeqCst), 2);
}
