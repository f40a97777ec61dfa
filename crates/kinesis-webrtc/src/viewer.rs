//! Viewer role: one outbound connection to the channel's master.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::ViewerConfig;
use crate::endpoints::{ChannelRole, SignalingChannelEndpoints, SignalingEndpointResolver};
use crate::error::{
    ConfigurationError, DependencyError, MediaError, ProtocolError, RtcError, SessionError,
};
use crate::ice::{IceServerConfig, IceServerResolver};
use crate::listeners::ListenerId;
use crate::log::SessionLog;
use crate::media::{LocalMediaManager, MediaStream, TrackKind};
use crate::rtc::{
    IceCandidate, OfferOptions, PeerConnection, PeerConnectionConfig, PeerConnectionEvent,
    SessionDescription, TransceiverDirection,
};
use crate::session::{wait_for_state, SessionServices};
use crate::signaling::{
    OutboundSignal, SignalingClientConfig, SignalingEvent, SignalingHandler, SignalingSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerPhase {
    Idle,
    AwaitingIce,
    Offering,
    AwaitingAnswer,
    Connected,
    Failed,
    Closed,
}

/// The single remote peer a viewer talks to.
#[derive(Debug, Clone)]
pub struct ViewerPeer {
    /// This viewer's signaling client id.
    pub id: String,
    pub connection: Option<Arc<dyn PeerConnection>>,
    pub media: Option<MediaStream>,
}

#[derive(Debug, Clone)]
pub struct ViewerState {
    pub phase: ViewerPhase,
    pub error: Option<SessionError>,
    pub local_media: Option<MediaStream>,
    pub peer: ViewerPeer,
}

pub struct ViewerSession {
    client_id: String,
    state: watch::Receiver<ViewerState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ViewerSession {
    /// Validates synchronously and generates a client id when none was
    /// configured.
    pub fn start(
        config: ViewerConfig,
        services: SessionServices,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let resolver = SignalingEndpointResolver::new(
            services.channels.clone(),
            &config.channel_arn,
            ChannelRole::Viewer,
        )?;
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (state_tx, state_rx) = watch::channel(ViewerState {
            phase: ViewerPhase::Idle,
            error: None,
            local_media: None,
            peer: ViewerPeer {
                id: client_id.clone(),
                connection: None,
                media: None,
            },
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tasks = shutdown.child_token();
        let actor = ViewerActor {
            log: SessionLog::new(ChannelRole::Viewer, &config.channel_arn, config.debug),
            media: Arc::new(LocalMediaManager::new(services.media_devices.clone())),
            endpoint_resolver: Some(resolver.with_cancellation(tasks.child_token())),
            client_id: client_id.clone(),
            config,
            services,
            events: events_tx,
            tasks,
            local_media: LocalMedia::Pending,
            ice_servers: None,
            signaling: None,
            signaling_open: false,
            connection: None,
            listener: None,
            creating: false,
            prepared: false,
            offer_sent: false,
            answer_pending: false,
            answer_applied: false,
            early_candidates: Vec::new(),
            remote_media: None,
            phase: ViewerPhase::Idle,
            error: None,
            state: state_tx,
        };
        let task = tokio::spawn(actor.run(events_rx, shutdown.clone()));

        Ok(Self {
            client_id,
            state: state_rx,
            shutdown,
            task: Some(task),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ViewerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerState> {
        self.state.clone()
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ViewerState) -> bool,
    ) -> Option<ViewerState> {
        let mut receiver = self.state.clone();
        wait_for_state(&mut receiver, predicate).await
    }

    pub async fn dispose(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "viewer session task ended abnormally");
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum ViewerEvent {
    Endpoints(Result<SignalingChannelEndpoints, DependencyError>),
    IceServers(Result<Vec<IceServerConfig>, DependencyError>),
    LocalMedia(Result<MediaStream, MediaError>),
    Signaling(SignalingEvent),
    Created(Result<Arc<dyn PeerConnection>, RtcError>),
    Offered(Result<SessionDescription, ProtocolError>),
    AnswerApplied(Result<(), RtcError>),
    CandidateApplied(Result<(), RtcError>),
    Peer(PeerConnectionEvent),
}

enum LocalMedia {
    Pending,
    ViewerOnly,
    Ready(MediaStream),
    Released,
}

struct ViewerActor {
    config: ViewerConfig,
    services: SessionServices,
    client_id: String,
    log: SessionLog,
    events: mpsc::UnboundedSender<ViewerEvent>,
    tasks: CancellationToken,
    media: Arc<LocalMediaManager>,
    endpoint_resolver: Option<SignalingEndpointResolver>,
    local_media: LocalMedia,
    ice_servers: Option<Vec<IceServerConfig>>,
    signaling: Option<SignalingSession>,
    signaling_open: bool,
    connection: Option<Arc<dyn PeerConnection>>,
    listener: Option<ListenerId>,
    creating: bool,
    /// Local tracks or the receive-only transceiver are in place.
    prepared: bool,
    offer_sent: bool,
    /// An answer is being applied; later answers are ignored.
    answer_pending: bool,
    answer_applied: bool,
    early_candidates: Vec<IceCandidate>,
    remote_media: Option<MediaStream>,
    phase: ViewerPhase,
    error: Option<SessionError>,
    state: watch::Sender<ViewerState>,
}

impl ViewerActor {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ViewerEvent>,
        shutdown: CancellationToken,
    ) {
        self.begin();
        self.publish();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
            self.publish();
        }
        self.teardown();
        self.phase = ViewerPhase::Closed;
        self.publish();
        self.log.event("viewer session closed");
    }

    fn begin(&mut self) {
        self.phase = ViewerPhase::AwaitingIce;
        self.log.event("starting viewer session");

        match self.config.media.clone().filter(|_| !self.config.viewer_only()) {
            None => self.local_media = LocalMedia::ViewerOnly,
            Some(constraints) => {
                let media = self.media.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let event = match media.acquire(&constraints).await {
                        Ok(Some(stream)) => ViewerEvent::LocalMedia(Ok(stream)),
                        Ok(None) => return,
                        Err(err) => ViewerEvent::LocalMedia(Err(err)),
                    };
                    let _ = events.send(event);
                });
            }
        }

        if let Some(resolver) = self.endpoint_resolver.take() {
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Some(result) = resolver.resolve().await.transpose() {
                    let _ = events.send(ViewerEvent::Endpoints(result));
                }
            });
        }
    }

    async fn handle(&mut self, event: ViewerEvent) {
        if self.error.is_some() {
            if let ViewerEvent::Created(Ok(connection)) = event {
                connection.close();
            }
            return;
        }
        match event {
            ViewerEvent::Endpoints(Ok(endpoints)) => self.on_endpoints(endpoints),
            ViewerEvent::Endpoints(Err(err)) => self.fail(err.into()),
            ViewerEvent::IceServers(Ok(servers)) => {
                self.log.event("ice servers resolved");
                self.ice_servers = Some(servers);
                self.maybe_create();
            }
            ViewerEvent::IceServers(Err(err)) => self.fail(err.into()),
            ViewerEvent::LocalMedia(Ok(stream)) => {
                self.log.event("local media acquired");
                self.local_media = LocalMedia::Ready(stream);
                self.maybe_create();
            }
            ViewerEvent::LocalMedia(Err(err)) => self.fail(DependencyError::LocalMedia(err).into()),
            ViewerEvent::Signaling(event) => self.on_signaling(event),
            ViewerEvent::Created(Ok(connection)) => self.on_created(connection).await,
            ViewerEvent::Created(Err(err)) => {
                self.creating = false;
                self.fail(DependencyError::PeerConnection(err.to_string()).into());
            }
            ViewerEvent::Offered(result) => self.on_offered(result),
            ViewerEvent::AnswerApplied(Ok(())) => {
                self.log.event("applied sdp answer");
                self.answer_pending = false;
                self.answer_applied = true;
                for candidate in std::mem::take(&mut self.early_candidates) {
                    self.apply_remote_candidate(candidate);
                }
            }
            ViewerEvent::AnswerApplied(Err(err)) => {
                self.answer_pending = false;
                self.fail(ProtocolError::Negotiation(err.to_string()).into())
            }
            ViewerEvent::CandidateApplied(Ok(())) => {
                self.log.event("applied remote ice candidate");
            }
            ViewerEvent::CandidateApplied(Err(err)) => {
                self.fail(ProtocolError::Negotiation(err.to_string()).into())
            }
            ViewerEvent::Peer(event) => self.on_peer_event(event),
        }
    }

    fn on_endpoints(&mut self, endpoints: SignalingChannelEndpoints) {
        self.log.event("signaling endpoints resolved");
        let events = self.events.clone();
        let handler: SignalingHandler = Arc::new(move |event| {
            let _ = events.send(ViewerEvent::Signaling(event));
        });
        let config = SignalingClientConfig {
            channel_arn: self.config.channel_arn.clone(),
            channel_endpoint: endpoints.wss.clone(),
            role: ChannelRole::Viewer,
            region: self.config.region.clone(),
            client_id: Some(self.client_id.clone()),
            credentials: self.config.credentials.clone(),
            system_clock_offset_ms: self.services.channels.system_clock_offset_ms(),
        };
        let mut session =
            match SignalingSession::connect(self.services.signaling.as_ref(), config, handler) {
                Ok(session) => session,
                Err(err) => return self.fail(err),
            };
        if let Err(err) = session.open() {
            return self.fail(err.into());
        }
        self.signaling = Some(session);

        let resolver = match IceServerResolver::new(
            self.services.signaling_config.clone(),
            &self.config.channel_arn,
            &self.config.region,
        ) {
            Ok(resolver) => resolver.with_cancellation(self.tasks.child_token()),
            Err(err) => return self.fail(err.into()),
        };
        let events = self.events.clone();
        let https = endpoints.https;
        tokio::spawn(async move {
            if let Some(result) = resolver.resolve(&https).await.transpose() {
                let _ = events.send(ViewerEvent::IceServers(result));
            }
        });
    }

    /// At most one connection per session, and only once ICE servers and
    /// local media are settled.
    fn maybe_create(&mut self) {
        if self.creating || self.connection.is_some() {
            return;
        }
        if matches!(self.local_media, LocalMedia::Pending | LocalMedia::Released) {
            return;
        }
        let Some(ice_servers) = self.ice_servers.clone() else {
            return;
        };
        self.creating = true;
        let factory = self.services.peer_connections.clone();
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            let created = tokio::select! {
                _ = cancel.cancelled() => return,
                created = factory.create(PeerConnectionConfig { ice_servers }) => created,
            };
            let _ = events.send(ViewerEvent::Created(created));
        });
    }

    async fn on_created(&mut self, connection: Arc<dyn PeerConnection>) {
        self.creating = false;
        let events = self.events.clone();
        self.listener = Some(connection.subscribe(Arc::new(move |event| {
            let _ = events.send(ViewerEvent::Peer(event));
        })));
        self.connection = Some(connection.clone());
        self.phase = ViewerPhase::Offering;
        self.log.event("peer connection created");

        let local = match &self.local_media {
            LocalMedia::Ready(stream) => Some(stream.clone()),
            _ => None,
        };
        let prepared = match local {
            Some(stream) => add_local_tracks(connection.as_ref(), &stream).await,
            None => {
                connection
                    .add_transceiver(TrackKind::Video, TransceiverDirection::RecvOnly)
                    .await
            }
        };
        if let Err(err) = prepared {
            return self.fail(DependencyError::PeerConnection(err.to_string()).into());
        }
        self.prepared = true;
        self.maybe_offer();
    }

    fn maybe_offer(&mut self) {
        if self.offer_sent || !self.prepared || !self.signaling_open {
            return;
        }
        let Some(connection) = self.connection.clone() else {
            return;
        };
        self.offer_sent = true;
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = create_offer(connection.as_ref()) => result,
            };
            let _ = events.send(ViewerEvent::Offered(result));
        });
    }

    fn on_offered(&mut self, result: Result<SessionDescription, ProtocolError>) {
        let offer = match result {
            Ok(offer) => offer,
            Err(err) => return self.fail(err.into()),
        };
        let sent = match &self.signaling {
            Some(session) => session
                .send(&OutboundSignal::SdpOffer(offer), None)
                .map_err(|err| SessionError::from(DependencyError::Signaling(err.to_string()))),
            None => Err(ProtocolError::SignalingNotConnected.into()),
        };
        if let Err(err) = sent {
            return self.fail(err);
        }
        self.phase = ViewerPhase::AwaitingAnswer;
        self.log.event("sent sdp offer");
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => {
                self.log.event("signaling channel open");
                self.signaling_open = true;
                self.maybe_offer();
            }
            SignalingEvent::Close => {
                self.log.event("signaling channel closed");
                self.signaling_open = false;
            }
            SignalingEvent::Error(message) => self.fail(DependencyError::Signaling(message).into()),
            SignalingEvent::SdpOffer { .. } => {
                self.log.event("ignoring sdp offer sent to viewer");
            }
            SignalingEvent::SdpAnswer { description, .. } => self.on_answer(description),
            SignalingEvent::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate),
        }
    }

    fn on_answer(&mut self, answer: SessionDescription) {
        let Some(connection) = self.connection.clone() else {
            return self.fail(ProtocolError::PeerConnectionNotInitialized.into());
        };
        if self.answer_applied || self.answer_pending {
            self.log.event("ignoring repeated sdp answer");
            return;
        }
        self.answer_pending = true;
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connection.set_remote_description(answer) => result,
            };
            let _ = events.send(ViewerEvent::AnswerApplied(result));
        });
    }

    fn on_remote_candidate(&mut self, candidate: Option<IceCandidate>) {
        if self.connection.is_none() {
            return self.fail(ProtocolError::PeerConnectionNotInitialized.into());
        }
        let Some(candidate) = candidate else {
            return self.fail(ProtocolError::IceCandidateMissing.into());
        };
        if self.answer_applied {
            self.apply_remote_candidate(candidate);
        } else {
            self.early_candidates.push(candidate);
        }
    }

    fn apply_remote_candidate(&self, candidate: IceCandidate) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connection.add_ice_candidate(candidate).await;
            let _ = events.send(ViewerEvent::CandidateApplied(result));
        });
    }

    fn on_peer_event(&mut self, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(Some(candidate)) => {
                let sent = match self.signaling.as_ref().filter(|s| !s.is_closed()) {
                    Some(session) => session
                        .send(&OutboundSignal::IceCandidate(candidate), None)
                        .map_err(|err| {
                            SessionError::from(DependencyError::SendIceCandidate(err.to_string()))
                        }),
                    None => Err(ProtocolError::SignalingNotConnected.into()),
                };
                if let Err(err) = sent {
                    self.fail(err);
                }
            }
            PeerConnectionEvent::IceCandidate(None) => {
                self.log.event("ice gathering complete");
            }
            PeerConnectionEvent::Track { track, streams } => {
                let incoming = streams
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| MediaStream::from_track(track.id(), track.clone()));
                let stream = match self.remote_media.take() {
                    Some(mut existing) if existing.id() == incoming.id() => {
                        for track in incoming.tracks() {
                            existing.add_track(track.clone());
                        }
                        existing
                    }
                    Some(previous) => {
                        previous.stop_all();
                        incoming
                    }
                    None => incoming,
                };
                self.remote_media = Some(stream);
                self.phase = ViewerPhase::Connected;
                self.log.event("remote media attached");
            }
            PeerConnectionEvent::IceConnectionStateChange(state) => {
                self.log.event(&format!("ice connection state {state}"));
            }
        }
    }

    fn fail(&mut self, err: SessionError) {
        self.log.session_error(&err);
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.phase = ViewerPhase::Failed;
        self.teardown();
    }

    fn teardown(&mut self) {
        self.tasks.cancel();
        if let Some(mut session) = self.signaling.take() {
            session.close();
        }
        self.signaling_open = false;
        if let Some(connection) = self.connection.take() {
            if let Some(listener) = self.listener.take() {
                connection.unsubscribe(listener);
            }
            connection.close();
        }
        if let Some(stream) = self.remote_media.take() {
            stream.stop_all();
        }
        self.early_candidates.clear();
        self.media.dispose();
        self.local_media = LocalMedia::Released;
    }

    fn publish(&self) {
        let local_media = match &self.local_media {
            LocalMedia::Ready(stream) => Some(stream.clone()),
            _ => None,
        };
        self.state.send_replace(ViewerState {
            phase: self.phase,
            error: self.error.clone(),
            local_media,
            peer: ViewerPeer {
                id: self.client_id.clone(),
                connection: self.connection.clone(),
                media: self.remote_media.clone(),
            },
        });
    }
}

async fn add_local_tracks(
    connection: &dyn PeerConnection,
    stream: &MediaStream,
) -> Result<(), RtcError> {
    for track in stream.tracks() {
        connection.add_track(track.clone(), stream).await?;
    }
    Ok(())
}

async fn create_offer(connection: &dyn PeerConnection) -> Result<SessionDescription, ProtocolError> {
    let offer = connection
        .create_offer(OfferOptions::receive_audio_video())
        .await
        .map_err(|err| ProtocolError::Negotiation(err.to_string()))?;
    connection
        .set_local_description(offer)
        .await
        .map_err(|err| ProtocolError::SetLocalDescription(err.to_string()))?;
    connection
        .local_description()
        .await
        .ok_or(ProtocolError::LocalDescriptionMissing)
}
