//! Websocket transport for a Kinesis Video signaling channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use kinesis_webrtc::endpoints::ChannelRole;
use kinesis_webrtc::listeners::{ListenerId, Listeners};
use kinesis_webrtc::rtc::{IceCandidate, SessionDescription};
use kinesis_webrtc::signaling::{
    OutboundSignal, SignalingClientConfig, SignalingEvent, SignalingHandler, SignalingTransport,
    SignalingTransportFactory,
};
use kinesis_webrtc::{ServiceError, SignalingError};

use crate::sigv4::{presign_url, SigningParams};
use crate::wire::{self, InboundMessage};

pub struct WebSocketSignalingFactory;

impl WebSocketSignalingFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebSocketSignalingFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingTransportFactory for WebSocketSignalingFactory {
    fn create(
        &self,
        config: SignalingClientConfig,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        let runtime = Handle::try_current()
            .map_err(|err| SignalingError::Transport(format!("no tokio runtime: {err}")))?;
        Ok(Arc::new(WebSocketSignalingClient::new(config, runtime)))
    }
}

/// Frames sent before the socket connects are queued and flushed once it
/// does.
pub struct WebSocketSignalingClient {
    config: SignalingClientConfig,
    runtime: Handle,
    listeners: Arc<Listeners<SignalingEvent>>,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebSocketSignalingClient {
    pub fn new(config: SignalingClientConfig, runtime: Handle) -> Self {
        let (outbound, pending) = mpsc::unbounded_channel();
        Self {
            config,
            runtime,
            listeners: Arc::new(Listeners::new()),
            outbound,
            pending: Mutex::new(Some(pending)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, signal: &OutboundSignal, recipient: Option<&str>) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalingError::Closed);
        }
        let text = wire::encode(signal, recipient)?;
        trace!(action = wire::action(signal), recipient, "queueing signaling frame");
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)
    }
}

/// Presigned channel URL. Viewers identify themselves by client id.
pub fn signed_channel_url(config: &SignalingClientConfig) -> Result<Url, ServiceError> {
    let mut query = vec![("X-Amz-ChannelARN", config.channel_arn.as_str())];
    if config.role == ChannelRole::Viewer {
        if let Some(client_id) = config.client_id.as_deref() {
            query.push(("X-Amz-ClientId", client_id));
        }
    }
    let params = SigningParams::now(
        &config.credentials,
        &config.region,
        config.system_clock_offset_ms,
    );
    presign_url(&config.channel_endpoint, &query, &params)
}

impl SignalingTransport for WebSocketSignalingClient {
    fn open(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(outbound) = self.pending.lock().take() else {
            debug!("signaling websocket already opened");
            return;
        };
        let url = match signed_channel_url(&self.config) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "failed to sign signaling channel url");
                self.listeners.emit(SignalingEvent::Error(err.to_string()));
                return;
            }
        };
        let handle = self
            .runtime
            .spawn(run_connection(url, self.listeners.clone(), outbound));
        *self.task.lock() = Some(handle);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        debug!(role = %self.config.role, "signaling websocket closed");
    }

    fn subscribe(&self, handler: SignalingHandler) -> ListenerId {
        self.listeners.subscribe(handler)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    fn send_sdp_offer(
        &self,
        description: &SessionDescription,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        self.enqueue(&OutboundSignal::SdpOffer(description.clone()), recipient_client_id)
    }

    fn send_sdp_answer(
        &self,
        description: &SessionDescription,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        self.enqueue(&OutboundSignal::SdpAnswer(description.clone()), recipient_client_id)
    }

    fn send_ice_candidate(
        &self,
        candidate: &IceCandidate,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        self.enqueue(&OutboundSignal::IceCandidate(candidate.clone()), recipient_client_id)
    }
}

impl Drop for WebSocketSignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_connection(
    url: Url,
    listeners: Arc<Listeners<SignalingEvent>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let host = url.host_str().unwrap_or_default().to_string();
    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(host, error = %err, "signaling websocket connect failed");
            listeners.emit(SignalingEvent::Error(err.to_string()));
            return;
        }
    };
    info!(host, "signaling websocket connected");
    listeners.emit(SignalingEvent::Open);

    let (mut sink, mut source) = stream.split();
    let writer = async {
        while let Some(text) = outbound.recv().await {
            if let Err(err) = sink.send(Message::Text(text)).await {
                warn!(error = %err, "signaling websocket send failed");
                listeners.emit(SignalingEvent::Error(err.to_string()));
                break;
            }
        }
    };
    let reader = async {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => dispatch(&listeners, &text),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(&listeners, text),
                    Err(err) => warn!(error = %err, "dropping non-utf8 signaling frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "signaling websocket closed by service");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "signaling websocket error");
                    listeners.emit(SignalingEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    listeners.emit(SignalingEvent::Close);
}

fn dispatch(listeners: &Listeners<SignalingEvent>, text: &str) {
    match wire::decode(text) {
        Ok(Some(InboundMessage::Signal(event))) => listeners.emit(event),
        Ok(Some(InboundMessage::Status(status))) => warn!(
            correlation_id = status.correlation_id.as_deref().unwrap_or_default(),
            error_type = status.error_type.as_deref().unwrap_or_default(),
            status_code = status.status_code.as_deref().unwrap_or_default(),
            description = status.description.as_deref().unwrap_or_default(),
            "signaling service rejected a message"
        ),
        Ok(Some(InboundMessage::GoAway)) => info!("signaling service asked the client to reconnect"),
        Ok(Some(InboundMessage::ReconnectIceServer)) => {
            info!("signaling service rotated its ice servers")
        }
        Ok(Some(InboundMessage::Unknown(kind))) => debug!(kind, "ignoring signaling frame"),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "dropping malformed signaling frame"),
    }
}
