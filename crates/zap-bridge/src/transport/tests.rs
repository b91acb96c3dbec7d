use super::*;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Accepts one WebSocket connection on a local port.
async fn fake_bridge() -> (String, JoinHandle<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    (format!("ws://{addr}"), accept)
}

async fn connect(
    session_id: &str,
    credentials: Option<Credentials>,
) -> (TransportHandle, ServerSocket) {
    let (url, accept) = fake_bridge().await;
    let factory = BridgeTransportFactory::new(url, Duration::from_millis(500));
    let handle = factory.connect(session_id, credentials).await.unwrap();
    let server = accept.await.unwrap();
    (handle, server)
}

/// Next frame the bridge receives.
async fn recv_raw(server: &mut ServerSocket) -> Message {
    timeout(WAIT, server.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket ended")
        .unwrap()
}

async fn recv_json(server: &mut ServerSocket) -> Value {
    match recv_raw(server).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn send_json(server: &mut ServerSocket, value: Value) {
    server.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

#[tokio::test]
async fn test_hello_carries_session_and_credentials() {
    let creds = Credentials(json!({"noise_key": "abc"}));
    let (_handle, mut server) = connect("s1", Some(creds)).await;

    assert_eq!(
        recv_json(&mut server).await,
        json!({"type": "hello", "session_id": "s1", "credentials": {"noise_key": "abc"}})
    );
}

#[tokio::test]
async fn test_hello_without_credentials() {
    let (_handle, mut server) = connect("fresh", None).await;

    let hello = recv_json(&mut server).await;
    assert_eq!(hello["credentials"], Value::Null);
}

#[tokio::test]
async fn test_frames_become_events_in_order() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    send_json(&mut server, json!({"type": "qr", "code": "ABC"})).await;
    send_json(&mut server, json!({"type": "creds", "credentials": {"k": 1}})).await;
    send_json(&mut server, json!({"type": "open"})).await;
    send_json(
        &mut server,
        json!({
            "type": "message",
            "id": "M1",
            "from": "5511999887766@s.whatsapp.net",
            "text": "hello",
            "timestamp": "2026-03-01T12:00:00Z"
        }),
    )
    .await;

    let events = &mut handle.events;
    assert_eq!(next_event(events).await, TransportEvent::QrAvailable("ABC".into()));
    assert_eq!(
        next_event(events).await,
        TransportEvent::CredentialsChanged(Credentials(json!({"k": 1})))
    );
    assert_eq!(next_event(events).await, TransportEvent::Opened);
    match next_event(events).await {
        TransportEvent::MessageReceived(m) => {
            assert_eq!(m.id, "M1");
            assert_eq!(m.text, "hello");
            assert!(!m.from_me);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    server.send(Message::text("not json")).await.unwrap();
    send_json(&mut server, json!({"type": "presence", "who": "x"})).await;
    send_json(&mut server, json!({"type": "open"})).await;

    assert_eq!(next_event(&mut handle.events).await, TransportEvent::Opened);
    assert!(handle.transport.is_open());
}

#[tokio::test]
async fn test_logged_out_close_frame() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    send_json(&mut server, json!({"type": "close", "logged_out": true})).await;

    assert_eq!(
        next_event(&mut handle.events).await,
        TransportEvent::Closed(CloseReason::LoggedOut)
    );
    assert!(!handle.transport.is_open());
}

#[tokio::test]
async fn test_socket_drop_is_transient_close() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;
    assert!(handle.transport.is_open());

    drop(server);

    match next_event(&mut handle.events).await {
        TransportEvent::Closed(CloseReason::Transient(_)) => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!handle.transport.is_open());
}

#[tokio::test]
async fn test_send_resolves_with_bridge_message_id() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    let ack = handle
        .transport
        .send_text("5511999887766@s.whatsapp.net", "hi there")
        .await
        .unwrap();

    let frame = recv_json(&mut server).await;
    assert_eq!(frame["type"], "send");
    assert_eq!(frame["to"], "5511999887766@s.whatsapp.net");
    assert_eq!(frame["text"], "hi there");
    send_json(
        &mut server,
        json!({"type": "sent", "request_id": frame["request_id"], "message_id": "WA-1"}),
    )
    .await;

    assert_eq!(ack.await.unwrap(), "WA-1");
}

#[tokio::test]
async fn test_send_failure_reported_by_bridge() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    let ack = handle
        .transport
        .send_text("123@s.whatsapp.net", "hi")
        .await
        .unwrap();
    let frame = recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({"type": "send_failed", "request_id": frame["request_id"], "error": "not on whatsapp"}),
    )
    .await;

    match ack.await {
        Err(ZapError::Transport(msg)) => assert_eq!(msg, "not on whatsapp"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_send_times_out_without_ack() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    let ack = handle
        .transport
        .send_text("123@s.whatsapp.net", "hi")
        .await
        .unwrap();

    assert_eq!(recv_json(&mut server).await["type"], "send");
    assert!(matches!(ack.await, Err(ZapError::Transport(_))));
}

#[tokio::test]
async fn test_ack_not_held_up_by_undrained_events() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    let ack = handle
        .transport
        .send_text("123@s.whatsapp.net", "hi")
        .await
        .unwrap();
    let frame = recv_json(&mut server).await;

    for n in 0..(EVENT_BUFFER + 6) {
        send_json(
            &mut server,
            json!({
                "type": "message",
                "id": format!("M{n}"),
                "from": "5511999887766@s.whatsapp.net",
                "text": "queued",
                "timestamp": "2026-03-01T12:00:00Z"
            }),
        )
        .await;
    }
    send_json(
        &mut server,
        json!({"type": "sent", "request_id": frame["request_id"], "message_id": "WA-9"}),
    )
    .await;

    assert_eq!(ack.await.unwrap(), "WA-9");

    // Nothing was lost while the receiver was full.
    for n in 0..(EVENT_BUFFER + 6) {
        match next_event(&mut handle.events).await {
            TransportEvent::MessageReceived(m) => assert_eq!(m.id, format!("M{n}")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_send_after_socket_end_is_not_connected() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;
    drop(server);
    next_event(&mut handle.events).await;

    let result = handle.transport.send_text("123@s.whatsapp.net", "hi").await;
    assert!(matches!(result, Err(ZapError::NotConnected(_))));
}

#[tokio::test]
async fn test_ping_and_logout_frames() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    handle.transport.ping().await.unwrap();
    assert!(matches!(recv_raw(&mut server).await, Message::Ping(_)));

    handle.transport.logout().await.unwrap();
    assert_eq!(recv_json(&mut server).await, json!({"type": "logout"}));
}

#[tokio::test]
async fn test_close_marks_transport_closed() {
    let (mut handle, mut server) = connect("s1", None).await;
    recv_json(&mut server).await;

    handle.transport.close().await;

    assert!(!handle.transport.is_open());
    assert!(matches!(recv_raw(&mut server).await, Message::Close(_)));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let factory = BridgeTransportFactory::new(format!("ws://{addr}"), Duration::from_secs(2));
    let result = factory.connect("s1", None).await;

    assert!(matches!(result, Err(ZapError::Transport(_))));
}
