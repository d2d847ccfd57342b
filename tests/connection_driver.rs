// Integration tests for the real-time channel against a local WebSocket server

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::FakeConsole;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use pmlink::client::{ConnectionHandle, RecordingSink, SinkEvent};
use pmlink::common::types::ConnectionState;
use pmlink::protocol::ClientMessage;
use pmlink::ClientConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// Server side of one accepted connection.
struct Peer {
    received: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Peer {
    async fn next_json(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("no frame from client")
            .expect("peer gone")
    }

    fn push(&self, frame: Value) {
        self.outgoing.send(Message::Text(frame.to_string().into())).unwrap();
    }

    fn close(&self, code: CloseCode) {
        self.outgoing
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "test".into(),
            })))
            .unwrap();
    }
}

/// Accepts connections forever and hands each one to the test as a `Peer`.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (peers_tx, peers) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                continue;
            };
            let (received_tx, received) = mpsc::unbounded_channel();
            let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
            if peers_tx.send(Peer { received, outgoing }).is_err() {
                break;
            }
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        incoming = ws.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                    let _ = received_tx.send(value);
                                }
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                        outgoing = outgoing_rx.recv() => match outgoing {
                            Some(message) => {
                                let closing = matches!(message, Message::Close(_));
                                if ws.send(message).await.is_err() || closing {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    (base_url, peers)
}

fn config(base_url: &str) -> ClientConfig {
    ClientConfig::new(base_url)
        .with_reconnect_base_delay(Duration::from_millis(50))
        .with_availability_probe(None)
        .with_timeout(Duration::from_secs(5))
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("client did not connect")
        .expect("server stopped")
}

async fn wait_state(handle: &ConnectionHandle, state: ConnectionState) {
    assert!(
        timeout(Duration::from_secs(5), handle.wait_for(state)).await.unwrap_or(false),
        "channel never reached {:?}",
        state
    );
}

#[tokio::test]
async fn test_open_subscribes_to_all_channels() {
    let (base_url, mut peers) = spawn_server().await;
    let sink = Arc::new(RecordingSink::new());
    let handle = ConnectionHandle::spawn(&config(&base_url), Arc::new(FakeConsole::default()), sink.clone()).unwrap();

    assert!(!handle.send(ClientMessage::Heartbeat).await);

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    assert_eq!(
        peer.next_json().await,
        json!({"type": "subscribe", "channels": ["pmon", "deployment", "logs"]})
    );
    // the file list is refreshed on every open
    assert_eq!(peer.next_json().await, json!({"type": "getLogFiles"}));
    wait_state(&handle, ConnectionState::Open).await;

    assert!(handle.send(ClientMessage::Heartbeat).await);
    assert_eq!(peer.next_json().await, json!({"type": "heartbeat"}));

    assert!(sink.events().contains(&SinkEvent::Connection(ConnectionState::Open)));
    assert!(sink.notices().iter().any(|n| n.title == "Real-time Connected"));
}

#[tokio::test]
async fn test_resubscribes_from_last_offset_after_drop() {
    let (base_url, mut peers) = spawn_server().await;
    let sink = Arc::new(RecordingSink::new());
    let handle = ConnectionHandle::spawn(&config(&base_url), Arc::new(FakeConsole::default()), sink.clone()).unwrap();

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    peer.next_json().await;
    assert_eq!(peer.next_json().await["type"], "getLogFiles");
    wait_state(&handle, ConnectionState::Open).await;

    handle.subscribe_log("WCCILpmon.log", 0).unwrap();
    assert_eq!(
        peer.next_json().await,
        json!({"type": "subscribeLog", "file": "WCCILpmon.log", "startPos": 0})
    );

    peer.push(json!({"type": "log", "file": "WCCILpmon.log", "lines": ["started"], "lastPos": 2048}));
    timeout(Duration::from_secs(5), async {
        while handle.subscription().await.map(|s| s.offset) != Some(2048) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("offset never advanced");

    // server drops the channel abnormally
    peer.close(CloseCode::Error);

    let mut resumed = next_peer(&mut peers).await;
    assert_eq!(resumed.next_json().await["type"], "subscribe");
    let resubscribe = resumed.next_json().await;
    assert_eq!(resubscribe["type"], "subscribeLog");
    assert_eq!(resubscribe["file"], "WCCILpmon.log");
    // polling while down may have moved the offset further, never back
    assert!(resubscribe["startPos"].as_u64().unwrap() >= 2048);

    wait_state(&handle, ConnectionState::Open).await;
    let events = sink.events();
    assert!(events.contains(&SinkEvent::Connection(ConnectionState::Reconnecting)));
    assert!(events.iter().any(|e| matches!(
        e,
        SinkEvent::LogLines { lines, replace: false, .. } if lines == &vec!["started".to_string()]
    )));
}

#[tokio::test]
async fn test_normal_close_is_final() {
    let (base_url, mut peers) = spawn_server().await;
    let handle = ConnectionHandle::spawn(
        &config(&base_url),
        Arc::new(FakeConsole::default()),
        Arc::new(RecordingSink::new()),
    )
    .unwrap();

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    peer.next_json().await;
    wait_state(&handle, ConnectionState::Open).await;

    peer.close(CloseCode::Normal);
    wait_state(&handle, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(peers.try_recv().is_err(), "client reconnected after a normal close");
    assert!(!handle.send(ClientMessage::Heartbeat).await);
}

#[tokio::test]
async fn test_heartbeat_while_open() {
    let (base_url, mut peers) = spawn_server().await;
    let config = config(&base_url).with_heartbeat_interval(Duration::from_millis(50));
    let handle = ConnectionHandle::spawn(&config, Arc::new(FakeConsole::default()), Arc::new(RecordingSink::new())).unwrap();

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    assert_eq!(peer.next_json().await["type"], "subscribe");
    assert_eq!(peer.next_json().await["type"], "getLogFiles");
    assert_eq!(peer.next_json().await, json!({"type": "heartbeat"}));
    assert_eq!(peer.next_json().await, json!({"type": "heartbeat"}));
}

#[tokio::test]
async fn test_compressed_frame_reaches_sink() {
    let (base_url, mut peers) = spawn_server().await;
    let sink = Arc::new(RecordingSink::new());
    let handle = ConnectionHandle::spawn(&config(&base_url), Arc::new(FakeConsole::default()), sink.clone()).unwrap();

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    peer.next_json().await;
    wait_state(&handle, ConnectionState::Open).await;

    let status = json!({
        "type": "pmon",
        "instances": [{"hostname": "scada-01", "projectName": "plant", "progs": [
            {"manager": "WCCILevent", "state": "running", "pid": 4711, "shmId": 3}
        ]}]
    });
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(status.to_string().as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();
    peer.push(json!({
        "type": "pmon",
        "compressed": true,
        "encoding": "gzip",
        "data": STANDARD.encode(&compressed),
    }));

    // an unknown kind is ignored without disturbing the channel
    peer.push(json!({"type": "alarmSummary", "count": 3}));

    let snapshot = timeout(Duration::from_secs(5), async {
        loop {
            let found = sink.events().into_iter().find_map(|e| match e {
                SinkEvent::Snapshot(s) => Some(s),
                _ => None,
            });
            if let Some(snapshot) = found {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot never delivered");

    assert_eq!(snapshot.instances[0].hostname.as_deref(), Some("scada-01"));
    assert_eq!(snapshot.instances[0].progs[0].pid, "4711");
    assert!(snapshot.instances[0].progs[0].is_running());
    assert_eq!(handle.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_log_files_over_http_when_down() {
    let sink = Arc::new(RecordingSink::new());
    let config = ClientConfig::new("http://127.0.0.1:9").with_availability_probe(None);
    let handle = ConnectionHandle::spawn(&config, Arc::new(FakeConsole::default()), sink.clone()).unwrap();

    handle.request_log_files().unwrap();
    timeout(Duration::from_secs(5), async {
        while !sink.events().iter().any(|e| matches!(e, SinkEvent::LogFiles(files) if files[0].name == "PVSS_II.log")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("log files never delivered");
}

#[tokio::test]
async fn test_slow_poll_is_not_overlapped() {
    let api = Arc::new(FakeConsole {
        read_delay: Some(Duration::from_millis(300)),
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::new());
    let config = ClientConfig::new("http://127.0.0.1:9")
        .with_availability_probe(None)
        .with_log_poll_interval(Duration::from_millis(20));
    let handle = ConnectionHandle::spawn(&config, api.clone(), sink.clone()).unwrap();

    handle.subscribe_log("PVSS_II.log", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(api.log_reads.load(std::sync::atomic::Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let first_reads = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, SinkEvent::LogLines { lines, .. } if lines == &vec!["line after 0".to_string()]))
        .count();
    assert_eq!(first_reads, 1);
    assert_eq!(handle.subscription().await.map(|s| s.offset), Some(1));
}

#[tokio::test]
async fn test_normal_close_is_not_undone_by_probe() {
    let (base_url, mut peers) = spawn_server().await;
    let config = config(&base_url).with_availability_probe(Some(Duration::from_millis(20)));
    let handle = ConnectionHandle::spawn(&config, Arc::new(FakeConsole::default()), Arc::new(RecordingSink::new())).unwrap();

    handle.connect().unwrap();
    let mut peer = next_peer(&mut peers).await;
    peer.next_json().await;
    wait_state(&handle, ConnectionState::Open).await;

    peer.close(CloseCode::Normal);
    wait_state(&handle, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(peers.try_recv().is_err(), "channel reopened after a normal close");
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}
