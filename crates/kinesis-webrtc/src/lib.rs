//! Kinesis Video Streams WebRTC sessions.
//!
//! Responsibilities:
//! - resolving signaling endpoints and ICE servers for a channel
//! - running a master that accepts many viewers, or a viewer that connects
//!   to one master
//! - owning local capture, peer connections and the signaling session for
//!   the lifetime of a session handle
//!
//! Every cloud, platform and WebRTC dependency sits behind a trait so the
//! controllers run unchanged against [`mock`] collaborators.

pub mod config;
pub mod endpoints;
pub mod error;
pub mod ice;
pub mod listeners;
pub(crate) mod log;
pub mod master;
pub mod media;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod viewer;

pub use config::{Credentials, MasterConfig, MediaConstraints, VideoConstraints, ViewerConfig};
pub use endpoints::{ChannelRole, SignalingChannelEndpoints};
pub use error::{
    ConfigurationError, DependencyError, MediaError, ProtocolError, RtcError, ServiceError,
    SessionError, SignalingError, StateError,
};
pub use ice::IceServerConfig;
pub use master::{MasterPhase, MasterSession, MasterState};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use registry::{Peer, PeerStatus};
pub use retry::RetryPolicy;
pub use session::SessionServices;
pub use viewer::{ViewerPeer, ViewerPhase, ViewerSession, ViewerState};

/// Starts a master on the current tokio runtime.
pub fn start_master(
    config: MasterConfig,
    services: SessionServices,
) -> Result<MasterSession, ConfigurationError> {
    MasterSession::start(config, services)
}

/// Starts a viewer on the current tokio runtime.
pub fn start_viewer(
    config: ViewerConfig,
    services: SessionServices,
) -> Result<ViewerSession, ConfigurationError> {
    ViewerSession::start(config, services)
}
