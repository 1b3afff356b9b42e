/// Realtime integration tests
/// Connection lifecycle and session flows against a local WebSocket server
use futures_util::{SinkExt, StreamExt};
use marketlink_core::chat::DeliveryStatus;
use marketlink_core::realtime::{ConnectionFault, ConnectionManager, ConnectionState, ConnectionStatus, Frame};
use marketlink_core::{ChatSession, Config, Credential};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async};

fn test_config(addr: SocketAddr, max_reconnects: u32) -> Config {
    Config {
        ws_url: format!("ws://{}/ws", addr),
        max_reconnect_attempts: max_reconnects,
        reconnect_delay: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
    }
}

fn credential() -> Option<Credential> {
    Some(Credential::new("secret-token").unwrap())
}

/// Accept loop that counts TCP connections and hands each to `handler`
async fn spawn_server<F, Fut>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(stream));
        }
    });
    (addr, accepted)
}

async fn wait_for<P>(rx: &mut watch::Receiver<ConnectionStatus>, pred: P) -> ConnectionStatus
where
    P: Fn(&ConnectionStatus) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let status = rx.borrow_and_update().clone();
            if pred(&status) {
                return status;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("timed out waiting for connection status")
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionStatus>, state: ConnectionState) -> ConnectionStatus {
    wait_for(rx, |s| s.state == state).await
}

/// Answers searches and echoes chat messages back as deliveries
async fn marketplace_server(stream: TcpStream) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = Frame::from_text(text.as_str()) else {
            continue;
        };
        let reply = match frame.event_type.as_str() {
            "agent.search" => Frame::new(
                "agent.response",
                frame.request_id.clone(),
                json!({"answer": "found 1", "results": [{"id": "l1", "title": "Road bike", "price": 120.0}]}),
            ),
            "chat.message" => Frame::new(
                "chat.deliver",
                frame.request_id.clone(),
                json!({
                    "conversationId": "conv-1",
                    "messageId": "m1",
                    "fromUserId": "A",
                    "otherUserId": frame.payload["toUserId"].clone(),
                    "listingId": "l1",
                    "text": frame.payload["text"].clone(),
                }),
            ),
            _ => continue,
        };
        if ws.send(Message::text(reply.to_text().unwrap())).await.is_err() {
            return;
        }
    }
}

/// Sends a garbled frame ahead of every search answer
async fn garbled_then_answer(stream: TcpStream) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(Message::Text(text))) = ws.next().await {
        let Ok(frame) = Frame::from_text(text.as_str()) else {
            continue;
        };
        let reply = Frame::new(
            "agent.response",
            frame.request_id.clone(),
            json!({"answer": "still here", "results": []}),
        );
        if ws.send(Message::text("not json")).await.is_err()
            || ws.send(Message::text(reply.to_text().unwrap())).await.is_err()
        {
            return;
        }
    }
}

/// Drops the TCP stream before the WebSocket handshake
async fn drop_immediately(stream: TcpStream) {
    drop(stream);
}

async fn close_with_policy(stream: TcpStream) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "invalid token".into(),
        })))
        .await;
    while let Some(Ok(_)) = ws.next().await {}
}

async fn reject_unauthorized(stream: TcpStream) {
    let _ = accept_hdr_async(stream, |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
        Err(http::Response::builder()
            .status(401)
            .body(Some("unauthorized".to_string()))
            .unwrap())
    })
    .await;
}

#[tokio::test]
async fn test_connect_send_and_dispatch() {
    let (addr, _) = spawn_server(marketplace_server).await;
    let manager = ConnectionManager::new(test_config(addr, 5), credential());

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.subscribe("agent.response", move |frame| {
        let _ = tx.send(frame.clone());
        Ok(())
    });

    let mut status = manager.watch_status();
    manager.connect().unwrap();
    let open = wait_for_state(&mut status, ConnectionState::Open).await;
    assert!(open.connected());
    assert_eq!(open.reconnect_attempts, 0);

    let request = Frame::new("agent.search", Some("req-1".into()), json!({"query": "bike"}));
    manager.send(&request).unwrap();

    let reply = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply.request_id.as_deref(), Some("req-1"));
    assert_eq!(reply.payload["answer"], "found 1");

    manager.disconnect();
}

#[tokio::test]
async fn test_credential_sent_as_query_parameter() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (query_tx, query_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = query_tx.send(req.uri().query().map(str::to_string));
            Ok(resp)
        })
        .await;
        if let Ok(mut ws) = ws {
            while let Some(Ok(_)) = ws.next().await {}
        }
    });

    let manager = ConnectionManager::new(test_config(addr, 0), credential());
    manager.connect().unwrap();

    let query = timeout(Duration::from_secs(5), query_rx).await.unwrap().unwrap();
    assert_eq!(query.as_deref(), Some("token=secret-token"));
    manager.disconnect();
}

#[tokio::test]
async fn test_bounded_reconnect_then_terminal_failure() {
    let (addr, accepted) = spawn_server(drop_immediately).await;
    let manager = ConnectionManager::new(test_config(addr, 2), credential());
    let mut status = manager.watch_status();

    manager.connect().unwrap();
    let failed = wait_for_state(&mut status, ConnectionState::Failed).await;
    assert_eq!(failed.last_error, Some(ConnectionFault::RetriesExhausted(2)));

    // Initial attempt plus two reconnects, then nothing more
    sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(manager.status().state, ConnectionState::Failed);
}

#[tokio::test]
async fn test_policy_close_is_not_retried() {
    let (addr, accepted) = spawn_server(close_with_policy).await;
    let manager = ConnectionManager::new(test_config(addr, 5), credential());
    let mut status = manager.watch_status();

    manager.connect().unwrap();
    let failed = wait_for_state(&mut status, ConnectionState::Failed).await;
    assert_eq!(
        failed.last_error,
        Some(ConnectionFault::AuthRejected("invalid token".into()))
    );

    sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(manager.status().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_unauthorized_handshake_is_not_retried() {
    let (addr, accepted) = spawn_server(reject_unauthorized).await;
    let manager = ConnectionManager::new(test_config(addr, 5), credential());
    let mut status = manager.watch_status();

    manager.connect().unwrap();
    let failed = wait_for_state(&mut status, ConnectionState::Failed).await;
    assert!(matches!(failed.last_error, Some(ConnectionFault::AuthRejected(_))));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_connection_reconnects_and_resets_attempts() {
    let first = Arc::new(AtomicUsize::new(0));
    let seen = first.clone();
    let (addr, accepted) = spawn_server(move |stream: TcpStream| {
        let nth = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            if nth == 0 {
                // Vanish without a closing handshake
                drop(ws);
                return;
            }
            while let Some(Ok(_)) = ws.next().await {}
        }
    })
    .await;

    let manager = ConnectionManager::new(test_config(addr, 5), credential());
    let mut status = manager.watch_status();
    manager.connect().unwrap();

    // First connect is generation 1; the automatic reconnect opens generation 2
    let reopened = wait_for(&mut status, |s| {
        s.state == ConnectionState::Open && s.generation >= 2
    })
    .await;

    assert_eq!(reopened.reconnect_attempts, 0);
    assert!(reopened.last_error.is_none());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    manager.disconnect();
}

#[tokio::test]
async fn test_disconnect_sends_normal_close_and_stays_down() {
    let (close_tx, close_rx) = oneshot::channel::<Option<(u16, String)>>();
    let close_tx = Arc::new(parking_lot::Mutex::new(Some(close_tx)));
    let (addr, accepted) = spawn_server(move |stream: TcpStream| {
        let close_tx = close_tx.clone();
        async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let info = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                    if let Some(tx) = close_tx.lock().take() {
                        let _ = tx.send(info);
                    }
                    break;
                }
            }
        }
    })
    .await;

    let manager = ConnectionManager::new(test_config(addr, 5), credential());
    let mut status = manager.watch_status();
    manager.connect().unwrap();
    wait_for_state(&mut status, ConnectionState::Open).await;

    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Closed);

    let close = timeout(Duration::from_secs(5), close_rx).await.unwrap().unwrap();
    assert_eq!(close, Some((1000, "Client disconnect".to_string())));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(manager.status().state, ConnectionState::Closed);
}

#[tokio::test]
async fn test_session_search_and_chat_round_trip() {
    let (addr, _) = spawn_server(marketplace_server).await;
    let session = ChatSession::start(test_config(addr, 5), "A", credential()).unwrap();
    let mut status = session.watch_status();
    wait_for_state(&mut status, ConnectionState::Open).await;

    let answer = ChatSession::answer(session.search("road bike").unwrap())
        .await
        .unwrap();
    assert_eq!(answer.answer_text(), "found 1");
    assert_eq!(answer.results[0].title, "Road bike");

    let thread = session.open_thread("B", Some("l1"), Some("Road bike"), None).unwrap();
    assert_eq!(thread, "temp-A-B-l1");
    let receipt = session.send_chat(&thread, "Is it still available?").unwrap();
    assert_eq!(receipt.message_id, format!("temp-{}", receipt.request_id));

    // The echo promotes the temporary thread and confirms the message
    let conv = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(conv) = session.thread("conv-1") {
                if conv.messages.iter().all(|m| m.status == DeliveryStatus::Delivered) {
                    return conv;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(conv.messages.len(), 1);
    assert_eq!(conv.messages[0].id, "m1");
    assert!(session.thread("temp-A-B-l1").is_none());
    assert_eq!(session.active_thread_id().as_deref(), Some("conv-1"));
    assert_eq!(session.threads().len(), 1);

    session.logout();
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_without_breaking_the_link() {
    let (addr, accepted) = spawn_server(garbled_then_answer).await;
    let session = ChatSession::start(test_config(addr, 5), "A", credential()).unwrap();
    let mut status = session.watch_status();
    let open = wait_for_state(&mut status, ConnectionState::Open).await;

    let answer = timeout(Duration::from_secs(5), ChatSession::answer(session.search("lamp").unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer.answer_text(), "still here");

    let after = session.status();
    assert_eq!(after.state, ConnectionState::Open);
    assert_eq!(after.generation, open.generation);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    session.logout();
}
