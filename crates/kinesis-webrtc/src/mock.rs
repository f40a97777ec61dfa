//! In-memory collaborators for tests and early wiring. Every mock records
//! what it was asked to do and lets the caller inject events or failures.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::MediaConstraints;
use crate::endpoints::{
    ChannelProtocol, ChannelRole, ChannelService, GetSignalingChannelEndpointOutput,
    ResourceEndpoint,
};
use crate::error::{MediaError, RtcError, ServiceError, SignalingError};
use crate::ice::{GetIceServerConfigOutput, IceServer, SignalingConfigService};
use crate::listeners::{ListenerId, Listeners};
use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::rtc::{
    IceCandidate, IceConnectionState, OfferOptions, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent, PeerConnectionFactory, PeerEventHandler, SessionDescription,
    TransceiverDirection,
};
use crate::session::SessionServices;
use crate::signaling::{
    OutboundSignal, SignalingClientConfig, SignalingEvent, SignalingHandler, SignalingTransport,
    SignalingTransportFactory,
};

/// Holds a mocked call until released.
#[derive(Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    async fn wait(&self) {
        let mut receiver = self.open.subscribe();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct CallLog {
    calls: AtomicUsize,
    gate: Mutex<Option<Gate>>,
}

impl CallLog {
    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
    }

    fn hold(&self) -> Gate {
        let gate = Gate::new();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_calls(&self, count: usize) {
        while self.calls() < count {
            tokio::task::yield_now().await;
        }
    }
}

pub struct MockTrack {
    id: String,
    kind: TrackKind,
    stops: AtomicUsize,
}

impl MockTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Self::with_id(format!("{kind}-{}", Uuid::new_v4()), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MockTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stops", &self.stop_count())
            .finish()
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }
}

/// Produces one mock track per requested kind.
#[derive(Default)]
pub struct MockMediaDevices {
    log: CallLog,
    failure: Mutex<Option<MediaError>>,
    produced: Mutex<Vec<(MediaStream, Vec<Arc<MockTrack>>)>>,
}

impl MockMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        let devices = Self::default();
        *devices.failure.lock() = Some(error);
        devices
    }

    pub fn hold(&self) -> Gate {
        self.log.hold()
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        self.log.wait_for_calls(count).await
    }

    pub fn produced(&self) -> Vec<MediaStream> {
        self.produced.lock().iter().map(|(stream, _)| stream.clone()).collect()
    }

    pub fn produced_tracks(&self) -> Vec<Arc<MockTrack>> {
        self.produced
            .lock()
            .iter()
            .flat_map(|(_, tracks)| tracks.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.log.enter().await;
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MockTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MockTrack::new(TrackKind::Video));
        }
        let stream = MediaStream::new(
            format!("local-{}", Uuid::new_v4()),
            tracks
                .iter()
                .map(|track| track.clone() as Arc<dyn MediaTrack>)
                .collect(),
        );
        self.produced.lock().push((stream.clone(), tracks));
        Ok(stream)
    }
}

pub struct MockChannelService {
    log: CallLog,
    requests: Mutex<Vec<(String, ChannelRole)>>,
    response: Mutex<Result<GetSignalingChannelEndpointOutput, ServiceError>>,
}

impl MockChannelService {
    pub const WSS: &'static str = "wss://signaling.kinesis.test";
    pub const HTTPS: &'static str = "https://signaling.kinesis.test";

    pub fn new() -> Self {
        Self::with_output(GetSignalingChannelEndpointOutput {
            resource_endpoint_list: Some(vec![
                ResourceEndpoint::new("WSS", Self::WSS),
                ResourceEndpoint::new("HTTPS", Self::HTTPS),
            ]),
        })
    }

    pub fn with_output(output: GetSignalingChannelEndpointOutput) -> Self {
        Self {
            log: CallLog::default(),
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Ok(output)),
        }
    }

    pub fn failing(error: ServiceError) -> Self {
        let service = Self::new();
        *service.response.lock() = Err(error);
        service
    }

    pub fn hold(&self) -> Gate {
        self.log.hold()
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        self.log.wait_for_calls(count).await
    }

    pub fn requests(&self) -> Vec<(String, ChannelRole)> {
        self.requests.lock().clone()
    }
}

impl Default for MockChannelService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelService for MockChannelService {
    async fn get_signaling_channel_endpoint(
        &self,
        channel_arn: &str,
        role: ChannelRole,
        _protocols: &[ChannelProtocol],
    ) -> Result<GetSignalingChannelEndpointOutput, ServiceError> {
        self.requests.lock().push((channel_arn.to_string(), role));
        self.log.enter().await;
        self.response.lock().clone()
    }
}

pub struct MockSignalingConfigService {
    log: CallLog,
    requests: Mutex<Vec<(String, String)>>,
    response: Mutex<Result<Option<GetIceServerConfigOutput>, ServiceError>>,
}

impl MockSignalingConfigService {
    pub fn new() -> Self {
        Self::with_response(Some(GetIceServerConfigOutput {
            ice_server_list: Some(vec![IceServer {
                uris: Some(vec!["turn:turn.kinesis.test:443?transport=udp".into()]),
                username: Some("user".into()),
                password: Some("pass".into()),
                ttl: Some(300),
            }]),
        }))
    }

    pub fn with_response(response: Option<GetIceServerConfigOutput>) -> Self {
        Self {
            log: CallLog::default(),
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Ok(response)),
        }
    }

    pub fn failing(error: ServiceError) -> Self {
        let service = Self::new();
        *service.response.lock() = Err(error);
        service
    }

    pub fn hold(&self) -> Gate {
        self.log.hold()
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        self.log.wait_for_calls(count).await
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

impl Default for MockSignalingConfigService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingConfigService for MockSignalingConfigService {
    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Option<GetIceServerConfigOutput>, ServiceError> {
        self.requests
            .lock()
            .push((channel_arn.to_string(), https_endpoint.to_string()));
        self.log.enter().await;
        self.response.lock().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSignal {
    pub signal: OutboundSignal,
    pub recipient: Option<String>,
}

pub struct MockSignalingTransport {
    config: SignalingClientConfig,
    listeners: Listeners<SignalingEvent>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    sent: Mutex<Vec<SentSignal>>,
    failing_kinds: Mutex<Vec<&'static str>>,
}

impl MockSignalingTransport {
    fn new(config: SignalingClientConfig) -> Self {
        Self {
            config,
            listeners: Listeners::new(),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            failing_kinds: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SignalingClientConfig {
        &self.config
    }

    pub fn emit(&self, event: SignalingEvent) {
        self.listeners.emit(event);
    }

    pub fn emit_offer(&self, peer_id: &str) {
        self.emit(SignalingEvent::SdpOffer {
            description: SessionDescription::offer(format!("v=0 offer from {peer_id}")),
            sender_client_id: Some(peer_id.to_string()),
        });
    }

    /// Makes every later send of this kind (`sdp_offer`, `sdp_answer`,
    /// `ice_candidate`) fail.
    pub fn fail_sends(&self, kind: &'static str) {
        self.failing_kinds.lock().push(kind);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn sent(&self) -> Vec<SentSignal> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<SentSignal> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.signal.kind() == kind)
            .cloned()
            .collect()
    }

    fn record(&self, signal: OutboundSignal, recipient: Option<&str>) -> Result<(), SignalingError> {
        if self.failing_kinds.lock().contains(&signal.kind()) {
            return Err(SignalingError::Transport(format!(
                "injected {} failure",
                signal.kind()
            )));
        }
        self.sent.lock().push(SentSignal {
            signal,
            recipient: recipient.map(String::from),
        });
        Ok(())
    }
}

impl SignalingTransport for MockSignalingTransport {
    fn open(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
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
        self.record(OutboundSignal::SdpOffer(description.clone()), recipient_client_id)
    }

    fn send_sdp_answer(
        &self,
        description: &SessionDescription,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        self.record(OutboundSignal::SdpAnswer(description.clone()), recipient_client_id)
    }

    fn send_ice_candidate(
        &self,
        candidate: &IceCandidate,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        self.record(OutboundSignal::IceCandidate(candidate.clone()), recipient_client_id)
    }
}

#[derive(Default)]
pub struct MockSignalingFactory {
    transports: Mutex<Vec<Arc<MockSignalingTransport>>>,
    failure: Mutex<Option<SignalingError>>,
}

impl MockSignalingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: SignalingError) -> Self {
        let factory = Self::default();
        *factory.failure.lock() = Some(error);
        factory
    }

    pub fn transports(&self) -> Vec<Arc<MockSignalingTransport>> {
        self.transports.lock().clone()
    }

    pub fn configs(&self) -> Vec<SignalingClientConfig> {
        self.transports
            .lock()
            .iter()
            .map(|transport| transport.config.clone())
            .collect()
    }

    pub fn last(&self) -> Option<Arc<MockSignalingTransport>> {
        self.transports.lock().last().cloned()
    }

    pub async fn wait_for_transport(&self) -> Arc<MockSignalingTransport> {
        loop {
            if let Some(transport) = self.last() {
                return transport;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl SignalingTransportFactory for MockSignalingFactory {
    fn create(
        &self,
        config: SignalingClientConfig,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let transport = Arc::new(MockSignalingTransport::new(config));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Failures applied to connections created by [`MockPeerConnectionFactory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockPeerFailures {
    pub set_local_description: bool,
    pub missing_local_description: bool,
    pub set_remote_description: bool,
    pub add_track: bool,
}

pub struct MockPeerConnection {
    id: String,
    config: PeerConnectionConfig,
    failures: MockPeerFailures,
    listeners: Listeners<PeerConnectionEvent>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<String>>,
    transceivers: Mutex<Vec<(TrackKind, TransceiverDirection)>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closes: AtomicUsize,
    ice_state: Mutex<IceConnectionState>,
    track_gate: Option<Gate>,
}

impl MockPeerConnection {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, PeerConnectionConfig::default(), MockPeerFailures::default(), None)
    }

    fn build(
        id: &str,
        config: PeerConnectionConfig,
        failures: MockPeerFailures,
        track_gate: Option<Gate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            config,
            failures,
            listeners: Listeners::new(),
            local: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            ice_state: Mutex::new(IceConnectionState::New),
            track_gate,
        })
    }

    pub fn config(&self) -> &PeerConnectionConfig {
        &self.config
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        self.listeners.emit(event);
    }

    pub fn emit_ice_candidate(&self, candidate: &str) {
        self.emit(PeerConnectionEvent::IceCandidate(Some(IceCandidate::new(candidate))));
    }

    /// Delivers a remote track belonging to `stream_id`.
    pub fn emit_track(&self, kind: TrackKind, stream_id: &str) -> Arc<MockTrack> {
        let track = MockTrack::new(kind);
        let remote: Arc<dyn MediaTrack> = track.clone();
        self.emit(PeerConnectionEvent::Track {
            track: remote.clone(),
            streams: vec![MediaStream::from_track(stream_id, remote)],
        });
        track
    }

    pub fn set_ice_state(&self, state: IceConnectionState) {
        *self.ice_state.lock() = state;
        self.emit(PeerConnectionEvent::IceConnectionStateChange(state));
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn transceivers(&self) -> Vec<(TrackKind, TransceiverDirection)> {
        self.transceivers.lock().clone()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answer_count(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for MockPeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeerConnection")
            .field("id", &self.id)
            .field("closes", &self.close_count())
            .finish()
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self, _options: OfferOptions) -> Result<SessionDescription, RtcError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.id)))
    }

    async fn create_answer(&self, _options: OfferOptions) -> Result<SessionDescription, RtcError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if self.failures.set_local_description {
            return Err(RtcError::new("injected set_local_description failure"));
        }
        if !self.failures.missing_local_description {
            *self.local.lock() = Some(description);
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if self.failures.set_remote_description {
            return Err(RtcError::new("injected set_remote_description failure"));
        }
        self.remote.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        _stream: &MediaStream,
    ) -> Result<(), RtcError> {
        if let Some(gate) = &self.track_gate {
            gate.wait().await;
        }
        if self.failures.add_track {
            return Err(RtcError::new("injected add_track failure"));
        }
        self.tracks.lock().push(track.id());
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), RtcError> {
        self.transceivers.lock().push((kind, direction));
        Ok(())
    }

    fn subscribe(&self, handler: PeerEventHandler) -> ListenerId {
        self.listeners.subscribe(handler)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.ice_state.lock() = IceConnectionState::Closed;
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.ice_state.lock()
    }
}

#[derive(Default)]
pub struct MockPeerConnectionFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    failures: Mutex<MockPeerFailures>,
    create_failure: Mutex<Option<RtcError>>,
    track_gate: Mutex<Option<Gate>>,
}

impl MockPeerConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: MockPeerFailures) -> Self {
        let factory = Self::default();
        *factory.failures.lock() = failures;
        factory
    }

    pub fn failing(error: RtcError) -> Self {
        let factory = Self::default();
        *factory.create_failure.lock() = Some(error);
        factory
    }

    /// Connections created after this call block in `add_track` until released.
    pub fn hold_add_track(&self) -> Gate {
        let gate = Gate::new();
        *self.track_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub async fn wait_for_created(&self, count: usize) -> Arc<MockPeerConnection> {
        loop {
            if let Some(connection) = self.created.lock().get(count - 1).cloned() {
                return connection;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create(
        &self,
        config: PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        if let Some(error) = self.create_failure.lock().clone() {
            return Err(error);
        }
        let mut created = self.created.lock();
        let connection = MockPeerConnection::build(
            &format!("pc-{}", created.len() + 1),
            config,
            *self.failures.lock(),
            self.track_gate.lock().clone(),
        );
        created.push(connection.clone());
        Ok(connection)
    }
}

/// A full set of mock collaborators, with typed handles kept for assertions.
#[derive(Clone)]
pub struct MockServices {
    pub channels: Arc<MockChannelService>,
    pub signaling_config: Arc<MockSignalingConfigService>,
    pub signaling: Arc<MockSignalingFactory>,
    pub peer_connections: Arc<MockPeerConnectionFactory>,
    pub media_devices: Arc<MockMediaDevices>,
}

impl MockServices {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(MockChannelService::new()),
            signaling_config: Arc::new(MockSignalingConfigService::new()),
            signaling: Arc::new(MockSignalingFactory::new()),
            peer_connections: Arc::new(MockPeerConnectionFactory::new()),
            media_devices: Arc::new(MockMediaDevices::new()),
        }
    }

    pub fn services(&self) -> SessionServices {
        SessionServices {
            channels: self.channels.clone(),
            signaling_config: self.signaling_config.clone(),
            signaling: self.signaling.clone(),
            peer_connections: self.peer_connections.clone(),
            media_devices: self.media_devices.clone(),
        }
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}
