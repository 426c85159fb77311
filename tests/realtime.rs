use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tolcprep_backend::{
    AppState, app,
    config::Config,
    realtime::{ClientState, Envelope, RealtimeClient},
    utils::generate_token,
};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(3);

const NOTIFIER: &str = "notifier";

async fn spawn_server() -> (SocketAddr, AppState) {
    let mut config = Config::with_secret("test-secret");
    config.notify_subjects = vec![NOTIFIER.to_string()];
    let state = AppState::new(config, None);
    let router = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });
    (addr, state)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn collector(client: &RealtimeClient, kind: &str) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _subscription = client.add_message_handler(kind, move |message| {
        let _ = tx.send(message.clone());
    });
    rx
}

#[tokio::test]
async fn client_handshake_binds_user_and_receives_pushes() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();
    let mut results = collector(&client, "quiz_result");

    client.set_user(Some("student-1".into())).await.unwrap();
    assert_eq!(client.state(), ClientState::Open);
    eventually("handshake", || state.hub.connections_for("student-1") == 1).await;

    let pushed = Envelope::new("quiz_result").with("score", 42);
    assert_eq!(state.hub.send_to_user("student-1", &pushed), 1);

    let received = timeout(WAIT, results.recv()).await.unwrap().unwrap();
    assert_eq!(received, pushed);
}

#[tokio::test]
async fn ping_round_trip_through_send_message() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();
    let mut pongs = collector(&client, "pong");

    assert!(!client.send_message(&Envelope::new("ping")));
    client.set_user(Some("student-2".into())).await.unwrap();
    eventually("handshake", || state.hub.connections_for("student-2") == 1).await;

    assert!(client.send_message(&Envelope::new("ping")));
    let pong = timeout(WAIT, pongs.recv()).await.unwrap().unwrap();
    assert_eq!(pong.kind, "pong");
}

#[tokio::test]
async fn unsubscribed_handler_stops_receiving() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first_tx = tx.clone();
    let first = client.add_message_handler("badge", move |_| {
        let _ = first_tx.send("first");
    });
    let _second = client.add_message_handler("badge", move |_| {
        let _ = tx.send("second");
    });

    client.set_user(Some("student-3".into())).await.unwrap();
    eventually("handshake", || state.hub.connections_for("student-3") == 1).await;

    state.hub.send_to_user("student-3", &Envelope::new("badge"));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("first"));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("second"));

    assert!(first.unsubscribe());
    state.hub.send_to_user("student-3", &Envelope::new("badge"));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("second"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn sign_out_closes_and_unregisters() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();

    client.set_user(Some("student-4".into())).await.unwrap();
    eventually("handshake", || state.hub.connections_for("student-4") == 1).await;

    client.set_user(None).await.unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.send_message(&Envelope::new("ping")));
    eventually("cleanup", || state.hub.stats().connections == 0).await;

    assert_eq!(state.hub.send_to_user("student-4", &Envelope::new("late")), 0);
}

#[tokio::test]
async fn every_tab_of_a_user_gets_the_message() {
    let (addr, state) = spawn_server().await;
    let base = format!("http://{}", addr);
    let tab_a = RealtimeClient::new(&base, "/ws").unwrap();
    let tab_b = RealtimeClient::new(&base, "/ws").unwrap();
    let mut inbox_a = collector(&tab_a, "notification");
    let mut inbox_b = collector(&tab_b, "notification");

    tab_a.set_user(Some("student-5".into())).await.unwrap();
    tab_b.set_user(Some("student-5".into())).await.unwrap();
    eventually("both tabs", || state.hub.connections_for("student-5") == 2).await;

    assert_eq!(state.hub.send_to_user("student-5", &Envelope::new("notification")), 2);
    assert!(timeout(WAIT, inbox_a.recv()).await.unwrap().is_some());
    assert!(timeout(WAIT, inbox_b.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn nothing_is_delivered_before_the_handshake() {
    let (addr, state) = spawn_server().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    eventually("registration", || state.hub.stats().connections == 1).await;

    assert_eq!(state.hub.send_to_user("student-6", &Envelope::new("early")), 0);

    // a malformed frame neither closes the socket nor blocks the handshake
    socket.send(Message::text("{oops")).await.unwrap();
    socket
        .send(Message::text(r#"{"type":"auth","userId":"student-6"}"#))
        .await
        .unwrap();
    eventually("handshake", || state.hub.connections_for("student-6") == 1).await;

    assert_eq!(state.hub.send_to_user("student-6", &Envelope::new("late")), 1);
    assert_eq!(next_json(&mut socket).await, json!({"type": "late"}));
}

#[tokio::test]
async fn dropped_socket_is_cleaned_up() {
    let (addr, state) = spawn_server().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    socket
        .send(Message::text(r#"{"type":"auth","userId":7}"#))
        .await
        .unwrap();
    eventually("handshake", || state.hub.connections_for("7") == 1).await;

    socket.close(None).await.unwrap();
    drop(socket);
    eventually("cleanup", || state.hub.connections_for("7") == 0).await;
    assert_eq!(state.hub.send_to_user("7", &Envelope::new("gone")), 0);
}

#[tokio::test]
async fn notify_route_pushes_to_connected_user() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();
    let mut inbox = collector(&client, "premium_unlocked");
    client.set_user(Some("student-8".into())).await.unwrap();
    eventually("handshake", || state.hub.connections_for("student-8") == 1).await;

    let (token, _) = generate_token(NOTIFIER, &state.config).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/realtime/notify")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "user_id": "student-8",
                "message": {"type": "premium_unlocked", "plan": "annual"}
            })
            .to_string(),
        ))
        .unwrap();
    let response = app(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body, json!({"code": 0, "content": {"delivered": 1}}));

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.get("plan"), Some(&json!("annual")));
}

#[tokio::test]
async fn notify_route_requires_identity_and_a_typed_message() {
    let (_, state) = spawn_server().await;
    let payload = json!({"user_id": "u", "message": {"type": "x"}}).to_string();

    let anonymous = Request::builder()
        .method("POST")
        .uri("/api/realtime/notify")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap();
    let response = app(state.clone()).oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (token, _) = generate_token(NOTIFIER, &state.config).unwrap();
    for message in [json!({"no_type": 1}), json!({"type": "auth", "userId": "u"})] {
        let request = Request::builder()
            .method("POST")
            .uri("/api/realtime/notify")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"user_id": "u", "message": message}).to_string()))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn notify_route_refuses_ordinary_users() {
    let (addr, state) = spawn_server().await;
    let client = RealtimeClient::new(&format!("http://{}", addr), "/ws").unwrap();
    let mut inbox = collector(&client, "premium_unlocked");
    client.set_user(Some("student-9".into())).await.unwrap();
    eventually("handshake", || state.hub.connections_for("student-9") == 1).await;

    let (token, _) = generate_token("student-10", &state.config).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/realtime/notify")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"user_id": "student-9", "message": {"type": "premium_unlocked"}}).to_string(),
        ))
        .unwrap();
    let response = app(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["code"], json!(1003));

    sleep(Duration::from_millis(100)).await;
    assert!(inbox.try_recv().is_err());
}
