//! `PeerConnection` backed by the `webrtc` crate.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceCandidate, IceConnectionState, OfferOptions, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent, PeerConnectionFactory, PeerEventHandler, SdpType, SessionDescription,
    TransceiverDirection,
};
use crate::error::RtcError;
use crate::ice::IceServerConfig;
use crate::listeners::{ListenerId, Listeners};
use crate::media::{MediaStream, MediaTrack, TrackKind};

pub struct WebRtcPeerConnectionFactory {
    api: API,
}

impl WebRtcPeerConnectionFactory {
    /// Default codecs and interceptors.
    pub fn new() -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create(
        &self,
        config: PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let inner = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        Ok(WebRtcPeerConnection::wrap(inner))
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

pub struct WebRtcPeerConnection {
    id: String,
    inner: Arc<RTCPeerConnection>,
    listeners: Arc<Listeners<PeerConnectionEvent>>,
}

impl WebRtcPeerConnection {
    pub fn wrap(inner: Arc<RTCPeerConnection>) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let listeners: Arc<Listeners<PeerConnectionEvent>> = Arc::new(Listeners::new());

        let on_candidate = listeners.clone();
        let log_id = id.clone();
        inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let listeners = on_candidate.clone();
            let log_id = log_id.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(from_rtc_candidate(init)),
                        Err(err) => {
                            warn!(connection = %log_id, error = %err, "dropping unserializable ice candidate");
                            return;
                        }
                    },
                    None => None,
                };
                listeners.emit(PeerConnectionEvent::IceCandidate(candidate));
            })
        }));

        let on_track = listeners.clone();
        inner.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let stream_id = track.stream_id();
            let remote: Arc<dyn MediaTrack> = Arc::new(RemoteTrack::new(track));
            let stream = MediaStream::from_track(stream_id, remote.clone());
            on_track.emit(PeerConnectionEvent::Track {
                track: remote,
                streams: vec![stream],
            });
            Box::pin(async {})
        }));

        let on_state = listeners.clone();
        let log_id = id.clone();
        inner.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let state = from_rtc_ice_state(state);
            debug!(connection = %log_id, %state, "ice connection state changed");
            on_state.emit(PeerConnectionEvent::IceConnectionStateChange(state));
            Box::pin(async {})
        }));

        Arc::new(Self {
            id,
            inner,
            listeners,
        })
    }

    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.inner
    }

    async fn ensure_receiver(&self, kind: RTPCodecType) -> Result<(), RtcError> {
        let present = self
            .inner
            .get_transceivers()
            .await
            .iter()
            .any(|transceiver| transceiver.kind() == kind);
        if !present {
            self.inner
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for WebRtcPeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcPeerConnection")
            .field("id", &self.id)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError> {
        if options.offer_to_receive_audio {
            self.ensure_receiver(RTPCodecType::Audio).await?;
        }
        if options.offer_to_receive_video {
            self.ensure_receiver(RTPCodecType::Video).await?;
        }
        let offer = self.inner.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self, _options: OfferOptions) -> Result<SessionDescription, RtcError> {
        let answer = self.inner.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.inner
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.inner.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.inner
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream: &MediaStream,
    ) -> Result<(), RtcError> {
        let local = track.local_track().ok_or_else(|| {
            RtcError(format!("track {} of stream {} cannot be sent", track.id(), stream.id()))
        })?;
        let sender = self.inner.add_track(local).await?;
        // RTCP must be drained for interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), RtcError> {
        self.inner
            .add_transceiver_from_kind(
                to_codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: to_rtc_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    fn subscribe(&self, handler: PeerEventHandler) -> ListenerId {
        self.listeners.subscribe(handler)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.listeners.unsubscribe(id);
    }

    fn close(&self) {
        let inner = self.inner.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = inner.close().await {
                        warn!(connection = %id, error = %err, "peer connection close failed");
                    }
                });
            }
            Err(_) => warn!(connection = %id, "no runtime available to close peer connection"),
        }
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        from_rtc_ice_state(self.inner.ice_connection_state())
    }
}

/// Remote track delivered through `on_track`.
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    track: Arc<TrackRemote>,
}

impl RemoteTrack {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            id: track.id(),
            kind,
            stopped: AtomicBool::new(false),
            track,
        }
    }

    pub fn remote(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Local track fed with encoded samples by the application.
pub struct SampleTrack {
    kind: TrackKind,
    stopped: AtomicBool,
    track: Arc<TrackLocalStaticSample>,
}

impl SampleTrack {
    /// VP8 for video, Opus for audio.
    pub fn new(kind: TrackKind, track_id: &str, stream_id: &str) -> Arc<Self> {
        let codec = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        };
        Arc::new(Self {
            kind,
            stopped: AtomicBool::new(false),
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                track_id.to_owned(),
                stream_id.to_owned(),
            )),
        })
    }

    /// Samples written after `stop` are dropped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), RtcError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.track.id())
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> String {
        self.track.id().to_owned()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone())
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => return Err(RtcError::new("rollback descriptions are not supported")),
    };
    Ok(converted)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return Err(RtcError::new("unspecified sdp type")),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn to_codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}
