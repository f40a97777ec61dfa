use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use kinesis_aws::WebSocketSignalingFactory;
use kinesis_webrtc::endpoints::ChannelRole;
use kinesis_webrtc::rtc::{IceCandidate, SessionDescription};
use kinesis_webrtc::signaling::{
    SignalingClientConfig, SignalingEvent, SignalingTransport, SignalingTransportFactory,
};
use kinesis_webrtc::{Credentials, SignalingError};

const CHANNEL_ARN: &str = "arn:aws:kinesisvideo:us-west-2:123456789012:channel/demo/1";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ServerState {
    greeting: Vec<String>,
    hang_up: bool,
    queries: mpsc::UnboundedSender<HashMap<String, String>>,
    received: mpsc::UnboundedSender<String>,
}

struct MockChannel {
    endpoint: String,
    queries: mpsc::UnboundedReceiver<HashMap<String, String>>,
    received: mpsc::UnboundedReceiver<String>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> Response {
    let _ = state.queries.send(query);
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(mut socket: WebSocket, state: ServerState) {
    for frame in &state.greeting {
        if socket.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if state.hang_up {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Text(text) = message {
            let _ = state.received.send(text);
        }
    }
}

async fn spawn_channel(greeting: Vec<String>, hang_up: bool) -> MockChannel {
    let (queries_tx, queries) = mpsc::unbounded_channel();
    let (received_tx, received) = mpsc::unbounded_channel();
    let state = ServerState {
        greeting,
        hang_up,
        queries: queries_tx,
        received: received_tx,
    };
    let router = Router::new().route("/", get(upgrade)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    MockChannel {
        endpoint: format!("ws://{addr}"),
        queries,
        received,
    }
}

fn config(endpoint: &str, role: ChannelRole, client_id: Option<&str>) -> SignalingClientConfig {
    SignalingClientConfig {
        channel_arn: CHANNEL_ARN.into(),
        channel_endpoint: endpoint.into(),
        role,
        region: "us-west-2".into(),
        client_id: client_id.map(str::to_string),
        credentials: Credentials::new("AKIDEXAMPLE", "secret"),
        system_clock_offset_ms: 0,
    }
}

fn connect(
    config: SignalingClientConfig,
) -> (
    Arc<dyn SignalingTransport>,
    mpsc::UnboundedReceiver<SignalingEvent>,
) {
    let transport = WebSocketSignalingFactory::new()
        .create(config)
        .expect("transport");
    let (events_tx, events) = mpsc::unbounded_channel();
    transport.subscribe(Arc::new(move |event| {
        let _ = events_tx.send(event);
    }));
    (transport, events)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    timeout(WAIT, rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("{what} channel closed"))
}

fn offer_frame(sender: &str) -> String {
    json!({
        "messageType": "SDP_OFFER",
        "messagePayload": STANDARD.encode(json!({"type": "offer", "sdp": "v=0"}).to_string()),
        "senderClientId": sender,
    })
    .to_string()
}

#[tokio::test]
async fn master_receives_offer_and_answers_sender() {
    let mut channel = spawn_channel(vec![offer_frame("viewer-1")], false).await;
    let (transport, mut events) = connect(config(&channel.endpoint, ChannelRole::Master, None));
    transport.open();

    let query = next(&mut channel.queries, "upgrade request").await;
    assert_eq!(query.get("X-Amz-ChannelARN").map(String::as_str), Some(CHANNEL_ARN));
    assert_eq!(
        query.get("X-Amz-Algorithm").map(String::as_str),
        Some("AWS4-HMAC-SHA256")
    );
    assert!(query.contains_key("X-Amz-Signature"));
    assert!(!query.contains_key("X-Amz-ClientId"));

    assert_eq!(next(&mut events, "open").await, SignalingEvent::Open);
    assert_eq!(
        next(&mut events, "offer").await,
        SignalingEvent::SdpOffer {
            description: SessionDescription::offer("v=0"),
            sender_client_id: Some("viewer-1".into()),
        }
    );

    transport
        .send_sdp_answer(&SessionDescription::answer("v=0 answer"), Some("viewer-1"))
        .expect("answer queued");
    let frame: Value =
        serde_json::from_str(&next(&mut channel.received, "answer frame").await).expect("json");
    assert_eq!(frame["action"], "SDP_ANSWER");
    assert_eq!(frame["recipientClientId"], "viewer-1");

    transport.close();
}

#[tokio::test]
async fn viewer_frames_queued_before_connect_are_flushed() {
    let mut channel = spawn_channel(Vec::new(), false).await;
    let (transport, mut events) = connect(config(
        &channel.endpoint,
        ChannelRole::Viewer,
        Some("viewer-42"),
    ));

    transport
        .send_sdp_offer(&SessionDescription::offer("v=0"), None)
        .expect("offer queued");
    transport
        .send_ice_candidate(&IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"), None)
        .expect("candidate queued");
    transport.open();

    let query = next(&mut channel.queries, "upgrade request").await;
    assert_eq!(query.get("X-Amz-ClientId").map(String::as_str), Some("viewer-42"));
    assert_eq!(next(&mut events, "open").await, SignalingEvent::Open);

    let first: Value =
        serde_json::from_str(&next(&mut channel.received, "offer frame").await).expect("json");
    let second: Value =
        serde_json::from_str(&next(&mut channel.received, "candidate frame").await).expect("json");
    assert_eq!(first["action"], "SDP_OFFER");
    assert_eq!(second["action"], "ICE_CANDIDATE");
    assert!(first.get("recipientClientId").is_none());

    transport.close();
}

#[tokio::test]
async fn service_frames_are_not_forwarded_as_signals() {
    let greeting = vec![
        String::new(),
        json!({"messageType": "GO_AWAY"}).to_string(),
        "garbage".to_string(),
        offer_frame("viewer-2"),
    ];
    let channel = spawn_channel(greeting, false).await;
    let (transport, mut events) = connect(config(&channel.endpoint, ChannelRole::Master, None));
    transport.open();

    assert_eq!(next(&mut events, "open").await, SignalingEvent::Open);
    match next(&mut events, "offer").await {
        SignalingEvent::SdpOffer {
            sender_client_id, ..
        } => assert_eq!(sender_client_id.as_deref(), Some("viewer-2")),
        other => panic!("unexpected event {other:?}"),
    }
    transport.close();
}

#[tokio::test]
async fn service_hang_up_emits_close() {
    let channel = spawn_channel(Vec::new(), true).await;
    let (transport, mut events) = connect(config(&channel.endpoint, ChannelRole::Master, None));
    transport.open();

    assert_eq!(next(&mut events, "open").await, SignalingEvent::Open);
    assert_eq!(next(&mut events, "close").await, SignalingEvent::Close);
}

#[tokio::test]
async fn connect_failure_emits_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let (transport, mut events) = connect(config(
        &format!("ws://{addr}"),
        ChannelRole::Master,
        None,
    ));
    transport.open();

    assert!(matches!(
        next(&mut events, "error").await,
        SignalingEvent::Error(_)
    ));
}

#[tokio::test]
async fn sends_after_close_are_rejected() {
    let channel = spawn_channel(Vec::new(), false).await;
    let (transport, _events) = connect(config(&channel.endpoint, ChannelRole::Master, None));
    transport.open();
    transport.close();
    transport.close();

    let err = transport
        .send_sdp_answer(&SessionDescription::answer("v=0"), Some("viewer-1"))
        .expect_err("closed");
    assert_eq!(err, SignalingError::Closed);
}
