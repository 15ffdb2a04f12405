//! HTTP and WebSocket tests against a server on an ephemeral port

use audiotrigger_core::status::StatusSink;
use audiotrigger_core::{BroadcastBus, BusMessage, EngineSnapshot, MessageBus, TriggerConfig};
use audiotrigger_server::AppState;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: SocketAddr,
    bus: BroadcastBus,
    _status: StatusSink,
    _shutdown: oneshot::Sender<()>,
}

async fn start(config: TriggerConfig) -> TestServer {
    let status = StatusSink::new(EngineSnapshot::initial(48000));
    let bus = BroadcastBus::new(64);
    let state = AppState::new(status.handle(), bus.clone(), &config, Some("test-input".into()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = rx.await;
        };
        audiotrigger_server::serve(listener, state, shutdown)
            .await
            .unwrap();
    });

    TestServer {
        addr,
        bus,
        _status: status,
        _shutdown: tx,
    }
}

async fn next_frame<S>(socket: &mut S) -> serde_json::Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn test_status_endpoint() {
    let server = start(TriggerConfig::default()).await;
    let response = reqwest::get(format!("http://{}/api/v1/status", server.addr))
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers().get("x-frame-options").unwrap(),
        "DENY"
    );
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["state"], "IDLE");
    assert_eq!(json["sample_rate"], 48000);
    assert_eq!(json["device"], "test-input");
    assert_eq!(json["version"], audiotrigger_core::VERSION);
    assert!(json["last_levels"].is_null());
    assert_eq!(json["counters"]["events_persisted"], 0);
}

#[tokio::test]
async fn test_config_endpoint_redacts_password() {
    let mut config = TriggerConfig::default();
    config.bus.password = "hunter2".into();
    config.thresh_a80 = 72.5;
    let server = start(config).await;

    let json: serde_json::Value = reqwest::get(format!("http://{}/api/v1/config", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["bus"]["password"], "***");
    assert_eq!(json["thresh_a80"], 72.5);
}

#[tokio::test]
async fn test_no_mutating_routes() {
    let server = start(TriggerConfig::default()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/v1/config", server.addr))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test]
async fn test_websocket_mirrors_bus() {
    let server = start(TriggerConfig::default()).await;
    server
        .bus
        .publish(&BusMessage::new("audiotrigger/availability", "online").retained())
        .unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/ws", server.addr))
        .await
        .unwrap();

    let retained = next_frame(&mut socket).await;
    assert_eq!(retained["topic"], "audiotrigger/availability");
    assert_eq!(retained["payload"], "online");

    let status = next_frame(&mut socket).await;
    assert_eq!(status["topic"], "audiotrigger/status");
    let snapshot: serde_json::Value =
        serde_json::from_str(status["payload"].as_str().unwrap()).unwrap();
    assert_eq!(snapshot["state"], "IDLE");

    server
        .bus
        .publish(&BusMessage::new("audiotrigger/level/fast", "63.20"))
        .unwrap();
    let live = next_frame(&mut socket).await;
    assert_eq!(live["topic"], "audiotrigger/level/fast");
    assert_eq!(live["payload"], "63.20");
}
