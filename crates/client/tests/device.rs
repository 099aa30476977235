use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gaggimate_client::{trim_history, ClientConfig, ConnectionState, Device, DeviceEvent, Error};
use gaggimate_core::{Command, MachineMode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

// Requests the client fires on its own after every connect
const PRIMING: [&str; 2] = ["req:ota-settings", "req:profiles:list"];

/// A stand-in GaggiMate controller on a local port.
struct FakeDevice {
    port: u16,
    inbox: mpsc::UnboundedReceiver<Value>,
    conns: mpsc::UnboundedReceiver<Conn>,
}

/// Server side of one accepted connection. Dropping it closes the socket.
struct Conn {
    out: mpsc::UnboundedSender<Message>,
}

impl Conn {
    fn push(&self, v: Value) {
        let _ = self.out.send(Message::Text(v.to_string()));
    }

    fn push_raw(&self, s: &str) {
        let _ = self.out.send(Message::Text(s.to_string()));
    }
}

impl FakeDevice {
    async fn spawn() -> Self {
        Self::spawn_on(0).await
    }

    async fn spawn_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (conns_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let inbox_tx = inbox_tx.clone();
                let conns_tx = conns_tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else { return };
                    let (mut sink, mut source) = ws.split();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
                    if conns_tx.send(Conn { out: out_tx }).is_err() {
                        return;
                    }
                    loop {
                        tokio::select! {
                            out = out_rx.recv() => match out {
                                Some(msg) => {
                                    if sink.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            },
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                        let _ = inbox_tx.send(v);
                                    }
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            }
                        }
                    }
                });
            }
        });

        Self { port, inbox, conns }
    }

    fn config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new("127.0.0.1", self.port);
        cfg.connect_timeout = Duration::from_secs(2);
        cfg.request_timeout = Duration::from_secs(2);
        cfg.reconnect_delays = vec![Duration::from_millis(50)];
        cfg.temperature_step_delay = Duration::from_millis(1);
        cfg.steam_activation_delay = Duration::from_millis(10);
        cfg
    }

    async fn accept(&mut self) -> Conn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection from client")
            .expect("fake device stopped")
    }

    /// Next message from the client, ignoring connect-time priming requests.
    async fn next_request(&mut self) -> Value {
        loop {
            let msg = timeout(WAIT, self.inbox.recv())
                .await
                .expect("no message from client")
                .expect("fake device stopped");
            let tp = msg["tp"].as_str().unwrap_or_default();
            if !PRIMING.contains(&tp) {
                return msg;
            }
        }
    }

    /// Messages received before the first one tagged `marker`.
    async fn collect_until(&mut self, marker: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let msg = self.next_request().await;
            if msg["tp"] == marker {
                return seen;
            }
            seen.push(msg);
        }
    }
}

async fn wait_event(rx: &mut broadcast::Receiver<DeviceEvent>, pred: impl Fn(&DeviceEvent) -> bool) -> DeviceEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(e) if pred(&e) => return e,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected device event")
}

async fn wait_state(device: &Device, state: ConnectionState) {
    let mut rx = device.watch_connection();
    timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("connection state not reached")
        .expect("state channel closed");
}

fn is_status(e: &DeviceEvent) -> bool {
    matches!(e, DeviceEvent::Status(_))
}

#[tokio::test]
async fn status_push_updates_snapshot_after_malformed_frame() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    let mut events = device.events();
    device.start().await.unwrap();
    let conn = fake.accept().await;
    wait_state(&device, ConnectionState::Connected).await;

    conn.push_raw("not json");
    conn.push(json!({"tp": "evt:status", "ct": 92.1, "tt": 93, "m": 1, "p": "Classic"}));
    wait_event(&mut events, is_status).await;

    let snap = device.snapshot().await.unwrap();
    assert_eq!(snap.target_temperature(), Some(93.0));
    assert_eq!(snap.mode(), Some(MachineMode::Brew));
    assert_eq!(snap.selected_profile(), Some("Classic"));
    device.shutdown().await;
}

#[tokio::test]
async fn catalog_replies_fill_caches() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    let mut events = device.events();
    device.start().await.unwrap();
    let conn = fake.accept().await;

    conn.push(json!({
        "tp": "res:profiles:list",
        "profiles": [{"label": "A", "id": "1"}, {"id": "2"}, {"label": "B", "id": "3"}]
    }));
    wait_event(&mut events, |e| *e == DeviceEvent::ProfilesUpdated).await;
    conn.push(json!({"tp": "res:ota-settings", "hardware": "GaggiMate Pro", "displayVersion": "v1.5.2"}));
    wait_event(&mut events, |e| *e == DeviceEvent::OtaSettingsUpdated).await;

    let profiles = device.profiles().await;
    assert_eq!(profiles.iter().collect::<Vec<_>>(), vec![("A", "1"), ("B", "3")]);
    assert_eq!(device.ota_settings().await.hardware(), Some("GaggiMate Pro"));
    device.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_resolve_their_own_replies() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    device.start().await.unwrap();
    let conn = fake.accept().await;

    let d1 = device.clone();
    let select = tokio::spawn(async move { d1.request(Command::SelectProfile { id: "p1".into() }).await });
    let d2 = device.clone();
    let flush = tokio::spawn(async move { d2.request(Command::FlushStart).await });

    let a = fake.next_request().await;
    let b = fake.next_request().await;
    let (select_req, flush_req) = if a["tp"] == "req:profiles:select" { (a, b) } else { (b, a) };
    assert_eq!(select_req["id"], "p1");
    assert_ne!(select_req["rid"], flush_req["rid"]);

    // Answer in the opposite order
    conn.push(json!({"tp": "res:flush:start", "rid": flush_req["rid"], "which": "flush"}));
    conn.push(json!({"tp": "res:profiles:select", "rid": select_req["rid"], "which": "select"}));

    let select_reply = select.await.unwrap().unwrap();
    let flush_reply = flush.await.unwrap().unwrap();
    assert_eq!(select_reply["which"], "select");
    assert_eq!(flush_reply["which"], "flush");
    device.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out_and_late_reply_is_ignored() {
    let mut fake = FakeDevice::spawn().await;
    let mut cfg = fake.config();
    cfg.request_timeout = Duration::from_millis(200);
    let device = Device::new(cfg);
    let mut events = device.events();
    device.start().await.unwrap();
    let conn = fake.accept().await;

    let err = device.start_flush().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");

    let flush = fake.next_request().await;
    assert_eq!(flush["tp"], "req:flush:start");
    conn.push(json!({"tp": "res:flush:start", "rid": flush["rid"]}));
    conn.push(json!({"tp": "evt:status", "tt": 90}));
    wait_event(&mut events, is_status).await;
    assert_eq!(device.snapshot().await.unwrap().target_temperature(), Some(90.0));
    device.shutdown().await;
}

#[tokio::test]
async fn set_temperature_sends_one_nudge_per_degree() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    let mut events = device.events();
    device.start().await.unwrap();
    let conn = fake.accept().await;
    conn.push(json!({"tp": "evt:status", "ct": 92.0, "tt": 93}));
    wait_event(&mut events, is_status).await;

    device.set_temperature(96.0).await.unwrap();
    device.stop_brew().await.unwrap();
    let sent = fake.collect_until("req:process:deactivate").await;
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| m["tp"] == "req:raise-temp"));

    device.set_temperature(93.0).await.unwrap();
    device.stop_brew().await.unwrap();
    assert!(fake.collect_until("req:process:deactivate").await.is_empty());

    device.set_temperature(95.5).await.unwrap();
    device.stop_brew().await.unwrap();
    let sent = fake.collect_until("req:process:deactivate").await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m["tp"] == "req:raise-temp"));

    device.set_temperature(93.5).await.unwrap();
    device.stop_brew().await.unwrap();
    assert!(fake.collect_until("req:process:deactivate").await.is_empty());

    device.set_temperature(91.4).await.unwrap();
    device.stop_brew().await.unwrap();
    let sent = fake.collect_until("req:process:deactivate").await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m["tp"] == "req:lower-temp"));
    device.shutdown().await;
}

#[tokio::test]
async fn start_steam_switches_mode_before_activating() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    device.start().await.unwrap();
    let _conn = fake.accept().await;

    device.start_steam().await.unwrap();
    let first = fake.next_request().await;
    let second = fake.next_request().await;
    assert_eq!(first, json!({"tp": "req:change-mode", "mode": 2}));
    assert_eq!(second, json!({"tp": "req:process:activate"}));

    device.set_mode(MachineMode::Water).await.unwrap();
    assert_eq!(fake.next_request().await, json!({"tp": "req:change-mode", "mode": 3}));
    device.shutdown().await;
}

#[tokio::test]
async fn connect_primes_ota_and_profiles() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    device.start().await.unwrap();
    let _conn = fake.accept().await;

    let mut tags = Vec::new();
    for _ in 0..2 {
        let msg = timeout(WAIT, fake.inbox.recv()).await.unwrap().unwrap();
        tags.push(msg["tp"].as_str().unwrap().to_string());
        if msg["tp"] == "req:profiles:list" {
            assert!(msg["rid"].is_string());
        }
    }
    tags.sort();
    assert_eq!(tags, vec!["req:ota-settings", "req:profiles:list"]);
    device.shutdown().await;
}

#[tokio::test]
async fn silence_drops_snapshot_and_forces_reconnect() {
    let mut fake = FakeDevice::spawn().await;
    let mut cfg = fake.config();
    cfg.unavailable_timeout = Duration::from_millis(300);
    cfg.liveness_tick = Duration::from_millis(20);
    let device = Device::new(cfg);
    let mut events = device.events();
    device.start().await.unwrap();
    let first = fake.accept().await;

    first.push(json!({"tp": "evt:status", "tt": 93}));
    wait_event(&mut events, is_status).await;
    assert!(device.is_available().await);

    wait_event(&mut events, |e| *e == DeviceEvent::Unavailable).await;
    assert!(device.snapshot().await.is_none());

    // The server never closed its side; the client recycled the socket
    let _second = fake.accept().await;
    wait_state(&device, ConnectionState::Connected).await;
    assert_eq!(device.reconnect_attempt(), 0);
    device.shutdown().await;
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    let mut events = device.events();
    device.start().await.unwrap();
    let first = fake.accept().await;
    wait_state(&device, ConnectionState::Connected).await;

    drop(first);
    wait_event(&mut events, |e| *e == DeviceEvent::Disconnected).await;
    let _second = fake.accept().await;
    wait_event(&mut events, |e| *e == DeviceEvent::Connected).await;
    assert_eq!(device.connection_state(), ConnectionState::Connected);
    device.shutdown().await;
}

#[tokio::test]
async fn failed_first_connect_keeps_retrying() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let mut cfg = ClientConfig::new("127.0.0.1", port);
    cfg.connect_timeout = Duration::from_secs(1);
    cfg.reconnect_delays = vec![Duration::from_millis(20), Duration::from_millis(40)];
    let device = Device::new(cfg);

    assert!(matches!(device.start().await, Err(Error::Connect { .. })));
    timeout(WAIT, async {
        while device.reconnect_attempt() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnect attempts did not accumulate");
    assert!(matches!(device.start_brew().await, Err(Error::NotConnected)));

    let mut fake = FakeDevice::spawn_on(port).await;
    let _conn = fake.accept().await;
    wait_state(&device, ConnectionState::Connected).await;
    assert_eq!(device.reconnect_attempt(), 0);
    device.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_reconnecting() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    device.start().await.unwrap();
    let _conn = fake.accept().await;

    device.shutdown().await;
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(device.start_brew().await, Err(Error::NotConnected)));
    assert!(timeout(Duration::from_millis(300), fake.conns.recv()).await.is_err());
}

#[tokio::test]
async fn trim_history_over_the_wire() {
    let mut fake = FakeDevice::spawn().await;
    let device = Device::new(fake.config());
    device.start().await.unwrap();
    let conn = fake.accept().await;

    let d = device.clone();
    let trim = tokio::spawn(async move { trim_history(&d, 1).await });

    let list = fake.next_request().await;
    assert_eq!(list["tp"], "req:history:list");
    conn.push(json!({
        "tp": "res:history:list",
        "rid": list["rid"],
        "history": [{"id": 3, "timestamp": 30}, {"id": 1, "timestamp": 10}, {"id": 2, "timestamp": 20}]
    }));

    for expected in [1, 2] {
        let del = fake.next_request().await;
        assert_eq!(del["tp"], "req:history:delete");
        assert_eq!(del["id"], expected);
        conn.push(json!({"tp": "res:history:delete", "rid": del["rid"]}));
    }

    let report = trim.await.unwrap().unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.deleted, 2);
    assert!(report.failures.is_empty());
    device.shutdown().await;
}

#[tokio::test]
async fn stalled_handshake_reports_connect_timeout() {
    // Accepts TCP but never answers the WebSocket upgrade
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut cfg = ClientConfig::new("127.0.0.1", port);
    cfg.connect_timeout = Duration::from_millis(200);
    cfg.reconnect_delays = vec![Duration::from_secs(60)];
    let device = Device::new(cfg);

    let err = device.start().await.unwrap_err();
    assert!(matches!(err, Error::ConnectTimeout { .. }), "unexpected error: {err}");
    device.shutdown().await;
}
