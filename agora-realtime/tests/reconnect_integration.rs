//! Integration tests for the reconnecting connection manager.
//!
//! These tests start a real loopback WebSocket push server and drive a
//! manager against it through the full network stack: open, frame delivery,
//! server-initiated drops, backoff reconnection, and retry exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_realtime::{
    ConnectionConfig, ConnectionManager, ConnectionState, ManualVisibility, PresenceSender,
    WebSocketTransport,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

struct NullSender;

impl PresenceSender for NullSender {
    fn send_heartbeat(&self, _item_id: u64) {}
    fn send_stop(&self, _item_id: u64) {}
}

/// Loopback push server: pushes broadcast frames to every connected client,
/// drops all clients on `kick`.
struct PushServer {
    url: String,
    frames: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    accepted: Arc<AtomicUsize>,
}

impl PushServer {
    fn push(&self, frame: &str) {
        let _ = self.frames.send(frame.to_owned());
    }

    fn drop_clients(&self) {
        let _ = self.kick.send(());
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn start_push_server() -> PushServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let (frames_tx, _) = broadcast::channel::<String>(64);
    let (kick_tx, _) = broadcast::channel::<()>(8);
    let accepted = Arc::new(AtomicUsize::new(0));

    let frames = frames_tx.clone();
    let kick = kick_tx.clone();
    let count = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            count.fetch_add(1, Ordering::SeqCst);
            let mut frames_rx = frames.subscribe();
            let mut kick_rx = kick.subscribe();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                loop {
                    tokio::select! {
                        frame = frames_rx.recv() => match frame {
                            Ok(text) => {
                                if ws.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                        _ = kick_rx.recv() => {
                            let _ = ws.close(None).await;
                            break;
                        }
                        incoming = ws.next() => {
                            if matches!(incoming, None | Some(Err(_))) {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    PushServer {
        url,
        frames: frames_tx,
        kick: kick_tx,
        accepted,
    }
}

fn test_manager(url: &str) -> ConnectionManager {
    ConnectionManager::new(
        url,
        ConnectionConfig {
            base_delay: Duration::from_millis(30),
            max_delay: Duration::from_millis(120),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(3600),
        },
        Arc::new(WebSocketTransport),
        Arc::new(NullSender),
        Arc::new(ManualVisibility::new(true)),
    )
}

fn event_log(manager: &ConnectionManager) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let _ = manager.on_any(move |e| log.lock().unwrap().push(e.type_name().to_owned()));
    seen
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// ─── Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connects_and_reports_open() {
    let server = start_push_server().await;
    let manager = test_manager(&server.url);
    let events = event_log(&manager);

    manager.connect();
    wait_until(|| manager.is_connected()).await;

    assert_eq!(server.accepted(), 1);
    assert!(events.lock().unwrap().iter().any(|e| e == "connection.open"));
    manager.disconnect();
}

#[tokio::test]
async fn test_two_consumers_share_one_socket() {
    let server = start_push_server().await;
    let manager = test_manager(&server.url);
    let events = event_log(&manager);

    manager.connect();
    manager.connect();
    wait_until(|| manager.is_connected()).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(server.accepted(), 1);
    assert_eq!(
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "connection.open")
            .count(),
        1
    );

    manager.disconnect();
    sleep(Duration::from_millis(30)).await;
    assert!(manager.is_connected(), "first release must not close the socket");

    manager.disconnect();
    wait_until(|| manager.state() == ConnectionState::Closed).await;
    // Intentional close: no reconnect, no further accepts.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_frames_are_delivered_and_malformed_ones_dropped() {
    let server = start_push_server().await;
    let manager = test_manager(&server.url);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let _sub = manager.on_frame("queue.viewer_joined", move |e| {
        if let agora_realtime::RealtimeEvent::Frame { payload, .. } = e {
            log.lock().unwrap().push(payload["userId"].as_u64().unwrap());
        }
    });

    manager.connect();
    wait_until(|| manager.is_connected()).await;

    server.push("{ not json at all");
    server.push(r#"{"type":"queue.viewer_joined","payload":{"postId":5,"userId":1,"userName":"A"}}"#);
    server.push(r#"{"type":"queue.viewer_joined","payload":{"postId":5,"userId":2,"userName":"B"}}"#);

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert!(manager.is_connected(), "malformed frame must not drop the connection");

    let stats = manager.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_dropped, 1);
    manager.disconnect();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let server = start_push_server().await;
    let manager = test_manager(&server.url);
    let events = event_log(&manager);

    manager.connect();
    wait_until(|| manager.is_connected()).await;

    server.drop_clients();
    wait_until(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "connection.closed")
    })
    .await;
    wait_until(|| server.accepted() >= 2).await;
    wait_until(|| manager.is_connected()).await;

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.iter().filter(|e| *e == "connection.open").count(), 2);
    assert!(!seen.iter().any(|e| e == "connection.failed"));

    // The reconnected socket still delivers frames.
    let got = Arc::new(Mutex::new(false));
    let flag = got.clone();
    let _sub = manager.on_frame("queue.item_created", move |_| {
        *flag.lock().unwrap() = true;
    });
    server.push(r#"{"type":"queue.item_created","payload":{"postId":1}}"#);
    wait_until(|| *got.lock().unwrap()).await;
    manager.disconnect();
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // Bind then drop: nothing listens on this port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    drop(listener);

    let manager = ConnectionManager::new(
        url,
        ConnectionConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 2,
            heartbeat_interval: Duration::from_secs(3600),
        },
        Arc::new(WebSocketTransport),
        Arc::new(NullSender),
        Arc::new(ManualVisibility::new(true)),
    );
    let events = event_log(&manager);

    manager.connect();
    wait_until(|| manager.state() == ConnectionState::Failed).await;
    sleep(Duration::from_millis(100)).await;

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.iter().filter(|e| *e == "connection.failed").count(), 1);
    assert!(!seen.iter().any(|e| e == "connection.open"));
    manager.disconnect();
}
