//! Master role: accepts any number of viewers on one signaling channel.
//!
//! The controller is a single task draining one event queue. Collaborator
//! callbacks and spawned async steps only post events; all state, the peer
//! registry included, is mutated inside that task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::MasterConfig;
use crate::endpoints::{ChannelRole, SignalingChannelEndpoints, SignalingEndpointResolver};
use crate::error::{
    ConfigurationError, DependencyError, MediaError, ProtocolError, RtcError, SessionError,
};
use crate::ice::{IceServerConfig, IceServerResolver};
use crate::log::SessionLog;
use crate::media::{LocalMediaManager, MediaStream};
use crate::registry::{Peer, PeerRecord, PeerRegistry};
use crate::rtc::{
    IceCandidate, OfferOptions, PeerConnection, PeerConnectionConfig, PeerConnectionEvent,
    PeerEventHandler, SessionDescription,
};
use crate::session::{wait_for_state, SessionServices};
use crate::signaling::{
    OutboundSignal, SignalingClientConfig, SignalingEvent, SignalingHandler, SignalingSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterPhase {
    Idle,
    AwaitingDependencies,
    Open,
    Failed,
    Closed,
}

/// What a consumer of a master session observes.
#[derive(Debug, Clone)]
pub struct MasterState {
    pub phase: MasterPhase,
    pub error: Option<SessionError>,
    pub local_media: Option<MediaStream>,
    /// `ACTIVE` peers only, in arrival order.
    pub peers: Vec<Peer>,
    pub is_open: bool,
}

impl MasterState {
    fn idle() -> Self {
        Self {
            phase: MasterPhase::Idle,
            error: None,
            local_media: None,
            peers: Vec::new(),
            is_open: false,
        }
    }
}

pub struct MasterSession {
    state: watch::Receiver<MasterState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MasterSession {
    /// Validates synchronously, then runs the session on the current tokio
    /// runtime.
    pub fn start(
        config: MasterConfig,
        services: SessionServices,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let resolver = SignalingEndpointResolver::new(
            services.channels.clone(),
            &config.channel_arn,
            ChannelRole::Master,
        )?;

        let (state_tx, state_rx) = watch::channel(MasterState::idle());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tasks = shutdown.child_token();
        let actor = MasterActor {
            log: SessionLog::new(ChannelRole::Master, &config.channel_arn, config.debug),
            media: Arc::new(LocalMediaManager::new(services.media_devices.clone())),
            endpoint_resolver: Some(resolver.with_cancellation(tasks.child_token())),
            config,
            services,
            events: events_tx,
            tasks,
            local_media: LocalMediaSlot::Pending,
            ice_servers: None,
            signaling: None,
            listening: false,
            registry: PeerRegistry::new(),
            early_candidates: HashMap::new(),
            phase: MasterPhase::Idle,
            error: None,
            is_open: false,
            state: state_tx,
        };
        let task = tokio::spawn(actor.run(events_rx, shutdown.clone()));

        Ok(Self {
            state: state_rx,
            shutdown,
            task: Some(task),
        })
    }

    pub fn state(&self) -> MasterState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MasterState> {
        self.state.clone()
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&MasterState) -> bool,
    ) -> Option<MasterState> {
        let mut receiver = self.state.clone();
        wait_for_state(&mut receiver, predicate).await
    }

    /// Closes signaling, tears down every peer and stops local media.
    pub async fn dispose(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "master session task ended abnormally");
            }
        }
    }
}

impl Drop for MasterSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum MasterEvent {
    Endpoints(Result<SignalingChannelEndpoints, DependencyError>),
    IceServers(Result<Vec<IceServerConfig>, DependencyError>),
    LocalMedia(Result<MediaStream, MediaError>),
    Signaling(SignalingEvent),
    PeerCreated {
        peer_id: String,
        offer: SessionDescription,
        connection: Arc<dyn PeerConnection>,
    },
    PeerCreateFailed {
        peer_id: String,
        error: RtcError,
    },
    LocalTracks {
        peer_id: String,
        generation: u64,
        result: Result<(), ProtocolError>,
    },
    Answered {
        peer_id: String,
        generation: u64,
        result: Result<SessionDescription, ProtocolError>,
    },
    CandidateApplied {
        peer_id: String,
        generation: u64,
        result: Result<(), RtcError>,
    },
    Peer {
        peer_id: String,
        generation: u64,
        event: PeerConnectionEvent,
    },
}

enum LocalMediaSlot {
    Pending,
    NotRequired,
    Ready(MediaStream),
    Released,
}

struct MasterActor {
    config: MasterConfig,
    services: SessionServices,
    log: SessionLog,
    events: mpsc::UnboundedSender<MasterEvent>,
    tasks: CancellationToken,
    media: Arc<LocalMediaManager>,
    endpoint_resolver: Option<SignalingEndpointResolver>,
    local_media: LocalMediaSlot,
    ice_servers: Option<Vec<IceServerConfig>>,
    signaling: Option<SignalingSession>,
    listening: bool,
    registry: PeerRegistry,
    /// Remote candidates for peers whose answer has not been sent yet.
    early_candidates: HashMap<String, Vec<IceCandidate>>,
    phase: MasterPhase,
    error: Option<SessionError>,
    is_open: bool,
    state: watch::Sender<MasterState>,
}

impl MasterActor {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<MasterEvent>,
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
            self.handle(event);
            self.publish();
        }
        self.teardown();
        self.phase = MasterPhase::Closed;
        self.publish();
        self.log.event("master session closed");
    }

    fn begin(&mut self) {
        self.phase = MasterPhase::AwaitingDependencies;
        self.log.event("starting master session");

        if self.config.media.is_empty() {
            self.local_media = LocalMediaSlot::NotRequired;
        } else {
            let media = self.media.clone();
            let constraints = self.config.media.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let event = match media.acquire(&constraints).await {
                    Ok(Some(stream)) => MasterEvent::LocalMedia(Ok(stream)),
                    Ok(None) => return,
                    Err(err) => MasterEvent::LocalMedia(Err(err)),
                };
                let _ = events.send(event);
            });
        }

        if let Some(resolver) = self.endpoint_resolver.take() {
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Some(result) = resolver.resolve().await.transpose() {
                    let _ = events.send(MasterEvent::Endpoints(result));
                }
            });
        }
    }

    fn handle(&mut self, event: MasterEvent) {
        if self.error.is_some() {
            if let MasterEvent::PeerCreated { connection, .. } = event {
                connection.close();
            }
            return;
        }
        match event {
            MasterEvent::Endpoints(Ok(endpoints)) => self.on_endpoints(endpoints),
            MasterEvent::Endpoints(Err(err)) => self.fail(err.into()),
            MasterEvent::IceServers(Ok(servers)) => {
                self.log.event("ice servers resolved");
                self.ice_servers = Some(servers);
                self.maybe_listen();
            }
            MasterEvent::IceServers(Err(err)) => self.fail(err.into()),
            MasterEvent::LocalMedia(Ok(stream)) => self.on_local_media(stream),
            MasterEvent::LocalMedia(Err(err)) => self.fail(DependencyError::LocalMedia(err).into()),
            MasterEvent::Signaling(event) => self.on_signaling(event),
            MasterEvent::PeerCreated {
                peer_id,
                offer,
                connection,
            } => self.on_peer_created(peer_id, offer, connection),
            MasterEvent::PeerCreateFailed { peer_id, error } => {
                self.early_candidates.remove(&peer_id);
                let err = DependencyError::PeerConnection(error.to_string()).into();
                self.log.peer_error(&peer_id, &err);
            }
            MasterEvent::LocalTracks {
                peer_id,
                generation,
                result,
            } => self.on_local_tracks(peer_id, generation, result),
            MasterEvent::Answered {
                peer_id,
                generation,
                result,
            } => self.on_answered(peer_id, generation, result),
            MasterEvent::CandidateApplied {
                peer_id,
                generation,
                result,
            } => {
                if let Err(err) = result {
                    let err = ProtocolError::Negotiation(err.to_string()).into();
                    self.log.peer_error(&peer_id, &err);
                } else {
                    self.log
                        .peer_event(&peer_id, generation, "applied remote ice candidate");
                }
            }
            MasterEvent::Peer {
                peer_id,
                generation,
                event,
            } => self.on_peer_event(peer_id, generation, event),
        }
    }

    fn on_endpoints(&mut self, endpoints: SignalingChannelEndpoints) {
        self.log.event("signaling endpoints resolved");
        let events = self.events.clone();
        let handler: SignalingHandler = Arc::new(move |event| {
            let _ = events.send(MasterEvent::Signaling(event));
        });
        let config = SignalingClientConfig {
            channel_arn: self.config.channel_arn.clone(),
            channel_endpoint: endpoints.wss.clone(),
            role: ChannelRole::Master,
            region: self.config.region.clone(),
            client_id: None,
            credentials: self.config.credentials.clone(),
            system_clock_offset_ms: self.services.channels.system_clock_offset_ms(),
        };
        match SignalingSession::connect(self.services.signaling.as_ref(), config, handler) {
            Ok(session) => self.signaling = Some(session),
            Err(err) => return self.fail(err),
        }

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
                let _ = events.send(MasterEvent::IceServers(result));
            }
        });
        self.maybe_listen();
    }

    fn on_local_media(&mut self, stream: MediaStream) {
        self.log.event("local media acquired");
        self.local_media = LocalMediaSlot::Ready(stream.clone());
        for (peer_id, generation, connection) in self.registry.pending_media() {
            let events = self.events.clone();
            let cancel = self.tasks.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = add_local_tracks(connection.as_ref(), &stream) => result,
                };
                let _ = events.send(MasterEvent::LocalTracks {
                    peer_id,
                    generation,
                    result,
                });
            });
        }
        self.maybe_listen();
    }

    /// Opens signaling once ICE servers, local media and the session exist.
    fn maybe_listen(&mut self) {
        if self.listening
            || self.ice_servers.is_none()
            || matches!(self.local_media, LocalMediaSlot::Pending)
        {
            return;
        }
        let Some(session) = self.signaling.as_mut() else {
            return;
        };
        if let Err(err) = session.open() {
            return self.fail(err.into());
        }
        self.listening = true;
        self.phase = MasterPhase::Open;
        self.log.event("listening for offers");
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => {
                self.is_open = true;
                self.log.event("signaling channel open");
            }
            SignalingEvent::Close => {
                self.is_open = false;
                self.log.event("signaling channel closed");
            }
            SignalingEvent::Error(message) => self.fail(DependencyError::Signaling(message).into()),
            SignalingEvent::SdpOffer {
                description,
                sender_client_id,
            } => self.on_offer(description, sender_client_id),
            SignalingEvent::SdpAnswer { .. } => {
                self.log.event("ignoring sdp answer sent to master");
            }
            SignalingEvent::IceCandidate {
                candidate,
                sender_client_id,
            } => self.on_remote_candidate(candidate, sender_client_id),
        }
    }

    fn on_offer(&mut self, offer: SessionDescription, sender_client_id: Option<String>) {
        let Some(peer_id) = sender_client_id.filter(|id| !id.is_empty()) else {
            self.log
                .peer_error("", &ConfigurationError::PeerIdMissing.into());
            return;
        };
        let Some(ice_servers) = self.ice_servers.clone() else {
            self.log
                .peer_error(&peer_id, &ProtocolError::PeerConnectionNotInitialized.into());
            return;
        };
        self.log.peer_note(&peer_id, "received sdp offer");
        self.early_candidates.insert(peer_id.clone(), Vec::new());

        let factory = self.services.peer_connections.clone();
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            let created = tokio::select! {
                _ = cancel.cancelled() => return,
                created = factory.create(PeerConnectionConfig { ice_servers }) => created,
            };
            let event = match created {
                Ok(connection) => MasterEvent::PeerCreated {
                    peer_id,
                    offer,
                    connection,
                },
                Err(error) => MasterEvent::PeerCreateFailed { peer_id, error },
            };
            let _ = events.send(event);
        });
    }

    fn on_peer_created(
        &mut self,
        peer_id: String,
        offer: SessionDescription,
        connection: Arc<dyn PeerConnection>,
    ) {
        if let Some(previous) = self.registry.get(&peer_id).map(PeerRecord::generation) {
            self.log
                .peer_event(&peer_id, previous, "replacing registered peer");
            self.teardown_peer(&peer_id, false);
        }
        let generation = match self.registry.add_connection(&peer_id, Some(connection.clone())) {
            Ok(generation) => generation,
            Err(err) => {
                self.log.peer_error(&peer_id, &err);
                connection.close();
                return;
            }
        };

        let listener = connection.subscribe(peer_handler(
            self.events.clone(),
            peer_id.clone(),
            generation,
        ));
        let owned = connection.clone();
        let disposer = Box::new(move |record: &PeerRecord| {
            owned.unsubscribe(listener);
            if let Some(media) = record.media() {
                media.stop_all();
            }
            owned.close();
        });
        if let Err(err) = self.registry.set_disposer(&peer_id, disposer) {
            self.log.peer_error(&peer_id, &err.into());
        }
        self.log.peer_event(&peer_id, generation, "peer registered");

        let local_stream = match &self.local_media {
            LocalMediaSlot::Ready(stream) => Some(stream.clone()),
            _ => None,
        };
        if matches!(self.local_media, LocalMediaSlot::NotRequired) {
            if let Err(err) = self.registry.activate(&peer_id) {
                self.log.peer_error(&peer_id, &err);
            }
        }

        // Tracks go on before the answer is created so it advertises them.
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            let negotiation = async {
                if let Some(stream) = &local_stream {
                    let result = add_local_tracks(connection.as_ref(), stream).await;
                    let attached = result.is_ok();
                    let _ = events.send(MasterEvent::LocalTracks {
                        peer_id: peer_id.clone(),
                        generation,
                        result,
                    });
                    if !attached {
                        return None;
                    }
                }
                Some(answer_offer(connection.as_ref(), offer).await)
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = negotiation => result,
            };
            if let Some(result) = result {
                let _ = events.send(MasterEvent::Answered {
                    peer_id,
                    generation,
                    result,
                });
            }
        });
    }

    fn on_local_tracks(
        &mut self,
        peer_id: String,
        generation: u64,
        result: Result<(), ProtocolError>,
    ) {
        if !self.registry.is_current(&peer_id, generation) {
            return;
        }
        if let Err(err) = result {
            self.log.peer_error(&peer_id, &err.into());
            self.teardown_peer(&peer_id, true);
            return;
        }
        match self.registry.activate(&peer_id) {
            Ok(()) => self
                .log
                .peer_event(&peer_id, generation, "local media attached"),
            Err(err) => self.log.peer_error(&peer_id, &err),
        }
    }

    fn on_answered(
        &mut self,
        peer_id: String,
        generation: u64,
        result: Result<SessionDescription, ProtocolError>,
    ) {
        if !self.registry.is_current(&peer_id, generation) {
            return;
        }
        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                self.log.peer_error(&peer_id, &err.into());
                self.teardown_peer(&peer_id, true);
                return;
            }
        };
        let sent = match &self.signaling {
            Some(session) => session
                .send(&OutboundSignal::SdpAnswer(answer), Some(&peer_id))
                .map_err(|err| ProtocolError::Negotiation(err.to_string())),
            None => Err(ProtocolError::SignalingNotConnected),
        };
        if let Err(err) = sent {
            self.log.peer_error(&peer_id, &err.into());
            self.teardown_peer(&peer_id, true);
            return;
        }
        self.log.peer_event(&peer_id, generation, "sent sdp answer");

        for candidate in self.early_candidates.remove(&peer_id).unwrap_or_default() {
            self.apply_remote_candidate(&peer_id, generation, candidate);
        }
    }

    fn on_remote_candidate(&mut self, candidate: Option<IceCandidate>, sender: Option<String>) {
        let Some(peer_id) = sender.filter(|id| !id.is_empty()) else {
            self.log
                .peer_error("", &ConfigurationError::PeerIdMissing.into());
            return;
        };
        let Some(candidate) = candidate else {
            self.log
                .peer_error(&peer_id, &ProtocolError::IceCandidateMissing.into());
            return;
        };
        if let Some(buffer) = self.early_candidates.get_mut(&peer_id) {
            buffer.push(candidate);
            return;
        }
        match self.registry.get(&peer_id).map(PeerRecord::generation) {
            Some(generation) => self.apply_remote_candidate(&peer_id, generation, candidate),
            None => self
                .log
                .peer_error(&peer_id, &ProtocolError::PeerNotFound(peer_id.clone()).into()),
        }
    }

    fn apply_remote_candidate(&self, peer_id: &str, generation: u64, candidate: IceCandidate) {
        let Some(connection) = self.registry.get(peer_id).map(|r| r.connection().clone()) else {
            return;
        };
        let events = self.events.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let result = connection.add_ice_candidate(candidate).await;
            let _ = events.send(MasterEvent::CandidateApplied {
                peer_id,
                generation,
                result,
            });
        });
    }

    fn on_peer_event(&mut self, peer_id: String, generation: u64, event: PeerConnectionEvent) {
        if !self.registry.is_current(&peer_id, generation) {
            self.log
                .peer_event(&peer_id, generation, "dropping event from replaced connection");
            return;
        }
        match event {
            PeerConnectionEvent::IceCandidate(Some(candidate)) => {
                let sent = match &self.signaling {
                    Some(session) => session
                        .send(&OutboundSignal::IceCandidate(candidate), Some(&peer_id))
                        .map_err(|err| DependencyError::SendIceCandidate(err.to_string())),
                    None => Err(DependencyError::SendIceCandidate(
                        ProtocolError::SignalingNotConnected.to_string(),
                    )),
                };
                if let Err(err) = sent {
                    self.fail(err.into());
                }
            }
            PeerConnectionEvent::IceCandidate(None) => {
                self.log
                    .peer_event(&peer_id, generation, "ice gathering complete");
            }
            PeerConnectionEvent::Track { track, streams } => {
                let incoming = streams
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| MediaStream::from_track(track.id(), track.clone()));
                let stream = match self.registry.get(&peer_id).and_then(PeerRecord::media) {
                    Some(existing) if existing.id() == incoming.id() => {
                        let mut merged = existing.clone();
                        for track in incoming.tracks() {
                            merged.add_track(track.clone());
                        }
                        merged
                    }
                    _ => incoming,
                };
                match self.registry.attach_media(&peer_id, stream) {
                    Ok(()) => self
                        .log
                        .peer_event(&peer_id, generation, "remote media attached"),
                    Err(err) => self.log.peer_error(&peer_id, &err),
                }
            }
            PeerConnectionEvent::IceConnectionStateChange(state) => {
                self.log.peer_event(
                    &peer_id,
                    generation,
                    &format!("ice connection state {state}"),
                );
                if state.is_terminal() {
                    self.teardown_peer(&peer_id, true);
                }
            }
        }
    }

    /// INACTIVE, then removal; the disposer stops media and closes the
    /// connection.
    fn teardown_peer(&mut self, peer_id: &str, clear_candidates: bool) {
        if self.registry.mark_inactive(peer_id).is_err() {
            return;
        }
        let removed = self.registry.remove(peer_id);
        if clear_candidates {
            self.early_candidates.remove(peer_id);
        }
        if let Some(record) = removed {
            self.log
                .peer_event(peer_id, record.generation(), "peer removed");
        }
    }

    fn fail(&mut self, err: SessionError) {
        self.log.session_error(&err);
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.phase = MasterPhase::Failed;
        self.teardown();
    }

    fn teardown(&mut self) {
        self.tasks.cancel();
        if let Some(mut session) = self.signaling.take() {
            session.close();
        }
        self.is_open = false;
        self.listening = false;
        self.registry.drain();
        self.early_candidates.clear();
        self.media.dispose();
        self.local_media = LocalMediaSlot::Released;
    }

    fn publish(&self) {
        let local_media = match &self.local_media {
            LocalMediaSlot::Ready(stream) => Some(stream.clone()),
            _ => None,
        };
        self.state.send_replace(MasterState {
            phase: self.phase,
            error: self.error.clone(),
            local_media,
            peers: self.registry.active_peers(),
            is_open: self.is_open,
        });
    }
}

fn peer_handler(
    events: mpsc::UnboundedSender<MasterEvent>,
    peer_id: String,
    generation: u64,
) -> PeerEventHandler {
    Arc::new(move |event| {
        let _ = events.send(MasterEvent::Peer {
            peer_id: peer_id.clone(),
            generation,
            event,
        });
    })
}

async fn add_local_tracks(
    connection: &dyn PeerConnection,
    stream: &MediaStream,
) -> Result<(), ProtocolError> {
    for track in stream.tracks() {
        connection
            .add_track(track.clone(), stream)
            .await
            .map_err(|err| ProtocolError::Negotiation(err.to_string()))?;
    }
    Ok(())
}

/// Remote offer in, local answer out; strictly in this order.
async fn answer_offer(
    connection: &dyn PeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription, ProtocolError> {
    connection
        .set_remote_description(offer)
        .await
        .map_err(|err| ProtocolError::Negotiation(err.to_string()))?;
    let answer = connection
        .create_answer(OfferOptions::receive_audio_video())
        .await
        .map_err(|err| ProtocolError::Negotiation(err.to_string()))?;
    connection
        .set_local_description(answer)
        .await
        .map_err(|err| ProtocolError::SetLocalDescription(err.to_string()))?;
    connection
        .local_description()
        .await
        .ok_or(ProtocolError::LocalDescriptionMissing)
}
