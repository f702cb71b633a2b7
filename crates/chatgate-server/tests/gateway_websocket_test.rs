//! WebSocket integration tests for the gateway.
//!
//! These tests start a real server on port 0, connect with tokio-tungstenite
//! and drive the handshake and relay over the wire. The identity service is
//! replaced by an in-process verifier.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chatgate_core::{Envelope, GateResult, MsgType};
use chatgate_server::config::{RelayPolicy, ServerConfig};
use chatgate_server::transport::websocket::MAX_WS_FRAME_SIZE;
use chatgate_server::{GatewayServer, IdentityVerifier, VerifyError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepts bearer `valid` for any user and returns a profile naming the user.
struct TokenVerifier;

impl IdentityVerifier for TokenVerifier {
    fn verify<'a>(
        &'a self,
        bearer: &'a str,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, VerifyError>> + Send + 'a>> {
        Box::pin(async move {
            if bearer == "valid" {
                Ok(format!(r#"{{"uuid":"{user_id}"}}"#))
            } else {
                Err(VerifyError::Status(403))
            }
        })
    }
}

struct TestServer {
    ws_addr: SocketAddr,
    admin_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<GateResult<()>>,
}

async fn start_server(relay: RelayPolicy) -> TestServer {
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();

    let config = ServerConfig {
        relay,
        ..ServerConfig::default()
    };
    let server = GatewayServer::new(config, Arc::new(TokenVerifier));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(ws_listener, admin_listener, async move {
        let _ = stop_rx.await;
    }));

    TestServer {
        ws_addr,
        admin_addr,
        stop: stop_tx,
        task,
    }
}

async fn connect(server: &TestServer) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/echo", server.ws_addr))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, envelope: &Envelope) {
    ws.send(Message::text(serde_json::to_string(envelope).unwrap()))
        .await
        .unwrap();
}

/// Next envelope from the server; panics if the connection closes.
async fn recv(ws: &mut Client) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Assert the server closes the connection without sending an envelope.
async fn expect_closed(ws: &mut Client) {
    loop {
        let next = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("expected close, got {text}"),
            Some(Ok(_)) => continue,
        }
    }
}

async fn login(ws: &mut Client, user: &str) {
    let challenge = recv(ws).await;
    assert_eq!(challenge.msg_type, MsgType::Authenticate);

    let data = serde_json::json!({ "bearer": "valid", "user_uuid": user }).to_string();
    send(ws, &Envelope::new(MsgType::Authenticate, data)).await;

    let reply = recv(ws).await;
    assert_eq!(reply.msg_type, MsgType::Authenticated);
    assert_eq!(reply.data, format!(r#"{{"uuid":"{user}"}}"#));
}

#[tokio::test]
async fn server_challenges_first() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;

    let first = recv(&mut ws).await;
    assert_eq!(first, Envelope::challenge("123"));
}

#[tokio::test]
async fn chat_before_auth_is_dropped() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    recv(&mut ws).await;

    send(&mut ws, &Envelope::chat("let me in")).await;
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn rejected_token_is_dropped() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    recv(&mut ws).await;

    let data = serde_json::json!({ "bearer": "forged", "user_uuid": "mallory" }).to_string();
    send(&mut ws, &Envelope::new(MsgType::Authenticate, data)).await;
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn echo_policy_returns_chat_to_sender() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    login(&mut ws, "ada").await;

    send(&mut ws, &Envelope::new(MsgType::Update, r#"{"text":"hello"}"#)).await;
    assert_eq!(recv(&mut ws).await, Envelope::chat(r#"{"text":"hello"}"#));
}

#[tokio::test]
async fn others_policy_relays_between_clients() {
    let server = start_server(RelayPolicy::Others).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    login(&mut alice, "alice").await;
    login(&mut bob, "bob").await;

    send(&mut alice, &Envelope::chat("hi bob")).await;
    assert_eq!(recv(&mut bob).await, Envelope::chat("hi bob"));

    send(&mut bob, &Envelope::chat("hi alice")).await;
    assert_eq!(recv(&mut alice).await, Envelope::chat("hi alice"));
}

#[tokio::test]
async fn admin_update_reaches_remaining_sessions() {
    let server = start_server(RelayPolicy::All).await;
    let mut one = connect(&server).await;
    let mut two = connect(&server).await;
    let mut three = connect(&server).await;
    login(&mut one, "one").await;
    login(&mut two, "two").await;
    login(&mut three, "three").await;

    drop(two);

    let response = reqwest::Client::new()
        .post(format!("http://{}/update", server.admin_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");

    assert_eq!(recv(&mut one).await, Envelope::update());
    assert_eq!(recv(&mut three).await, Envelope::update());
}

#[tokio::test]
async fn oversized_message_before_auth_is_dropped() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    recv(&mut ws).await;

    // the server may reset the connection before the write finishes
    let _ = ws
        .send(Message::text("x".repeat(2 * MAX_WS_FRAME_SIZE)))
        .await;
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn message_under_limit_is_relayed() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    login(&mut ws, "ada").await;

    let body = "y".repeat(MAX_WS_FRAME_SIZE / 2);
    send(&mut ws, &Envelope::chat(body.clone())).await;
    assert_eq!(recv(&mut ws).await, Envelope::chat(body));
}

#[tokio::test]
async fn ping_is_answered_and_session_survives() {
    let server = start_server(RelayPolicy::Echo).await;
    let mut ws = connect(&server).await;
    login(&mut ws, "ada").await;

    ws.send(Message::Ping(vec![1, 2, 3])).await.unwrap();
    let pong = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for pong")
        .expect("connection ended")
        .expect("websocket error");
    assert_eq!(pong, Message::Pong(vec![1, 2, 3]));

    send(&mut ws, &Envelope::chat("still here")).await;
    assert_eq!(recv(&mut ws).await, Envelope::chat("still here"));
}

#[tokio::test]
async fn shutdown_closes_clients_before_serve_returns() {
    let server = start_server(RelayPolicy::All).await;
    let mut authed = connect(&server).await;
    let mut pending = connect(&server).await;
    login(&mut authed, "ada").await;
    recv(&mut pending).await;

    server.stop.send(()).unwrap();

    let served = timeout(Duration::from_secs(3), server.task)
        .await
        .expect("serve did not return after shutdown")
        .expect("serve task panicked");
    assert!(served.is_ok());

    // both sessions finished closing before serve returned
    expect_closed(&mut authed).await;
    expect_closed(&mut pending).await;
}
