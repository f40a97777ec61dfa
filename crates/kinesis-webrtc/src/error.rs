use thiserror::Error;

/// Raised synchronously when a session is constructed or an internal call is
/// made with missing inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Missing channel ARN")]
    ChannelArnMissing,
    #[error("Missing region")]
    RegionMissing,
    #[error("Please provide a connection object")]
    ConnectionMissing,
    #[error("Peer id is missing")]
    PeerIdMissing,
    #[error("Missing client id for viewer role")]
    ClientIdMissing,
}

/// Failures of an external collaborator. Session fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("signaling endpoint resolution failed: {0}")]
    Endpoints(String),
    #[error("Missing ResourceEndpointList")]
    ResourceEndpointListMissing,
    #[error("signaling channel has no {0} endpoint")]
    EndpointMissing(&'static str),
    #[error("ice server resolution failed: {0}")]
    IceServers(String),
    #[error("Could not get ice servers response")]
    IceServersResponseMissing,
    #[error("signaling session error: {0}")]
    Signaling(String),
    #[error("failed to send ice candidate: {0}")]
    SendIceCandidate(String),
    #[error("local media acquisition failed: {0}")]
    LocalMedia(#[from] MediaError),
    #[error("peer connection could not be created: {0}")]
    PeerConnection(String),
}

/// Negotiation contract violations. Scoped to one peer on the master,
/// session fatal on the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Could not find local description for peer connection")]
    LocalDescriptionMissing,
    #[error("failed to set local description: {0}")]
    SetLocalDescription(String),
    #[error("No ice candidate found")]
    IceCandidateMissing,
    #[error("Peer connection has not been initialized")]
    PeerConnectionNotInitialized,
    #[error("Peer connection not found: {0}")]
    PeerNotFound(String),
    #[error("Signaling client connection has not been established")]
    SignalingNotConnected,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(String),
    #[error("peer {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("signaling session is closed")]
    SessionClosed,
}

/// Anything a session can surface through its `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration(_) => "configuration",
            SessionError::Dependency(_) => "dependency",
            SessionError::Protocol(_) => "protocol",
            SessionError::State(_) => "state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device: {0}")]
    NotFound(String),
    #[error("media platform error: {0}")]
    Platform(String),
}

/// Transport or decoding failure from a cloud service call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("service returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("response could not be decoded: {0}")]
    Decode(String),
    #[error("request could not be signed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling transport is not open")]
    NotOpen,
    #[error("signaling transport is closed")]
    Closed,
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
    #[error("signaling transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer connection error: {0}")]
pub struct RtcError(pub String);

impl RtcError {
    pub fn new(err: impl std::fmt::Display) -> Self {
        RtcError(err.to_string())
    }
}

impl From<webrtc::Error> for RtcError {
    fn from(err: webrtc::Error) -> Self {
        RtcError(err.to_string())
    }
}
