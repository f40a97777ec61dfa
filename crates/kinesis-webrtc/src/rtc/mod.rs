//! Peer connection contract consumed by the session controllers.

pub mod webrtc_rs;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RtcError;
use crate::ice::IceServerConfig;
use crate::listeners::{Handler, ListenerId};
use crate::media::{MediaStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// JSON shape matches the browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// JSON shape matches the browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States that end a peer on the master side.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl OfferOptions {
    pub fn receive_audio_video() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    /// `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    Track {
        track: Arc<dyn MediaTrack>,
        streams: Vec<MediaStream>,
    },
    IceConnectionStateChange(IceConnectionState),
}

pub type PeerEventHandler = Handler<PeerConnectionEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

#[async_trait]
pub trait PeerConnection: Send + Sync + fmt::Debug {
    /// Local identifier, used only for logging.
    fn id(&self) -> &str;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self, options: OfferOptions)
        -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), RtcError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream: &MediaStream,
    ) -> Result<(), RtcError>;
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), RtcError>;

    fn subscribe(&self, handler: PeerEventHandler) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId);

    /// Starts closing; the transport shuts down in the background.
    fn close(&self);
    fn ice_connection_state(&self) -> IceConnectionState;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnection>, RtcError>;
}
