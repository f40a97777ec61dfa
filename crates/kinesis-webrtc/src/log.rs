use tracing::{debug, error, info, warn};

use crate::endpoints::ChannelRole;
use crate::error::SessionError;

/// Per-session logging context. With `debug` set, lifecycle events are
/// emitted at `info` instead of `debug`.
#[derive(Debug, Clone)]
pub(crate) struct SessionLog {
    role: ChannelRole,
    channel_arn: String,
    debug: bool,
}

impl SessionLog {
    pub(crate) fn new(role: ChannelRole, channel_arn: &str, debug: bool) -> Self {
        Self {
            role,
            channel_arn: channel_arn.to_string(),
            debug,
        }
    }

    pub(crate) fn event(&self, message: &str) {
        if self.debug {
            info!(role = %self.role, channel_arn = %self.channel_arn, "{message}");
        } else {
            debug!(role = %self.role, channel_arn = %self.channel_arn, "{message}");
        }
    }

    pub(crate) fn peer_event(&self, peer_id: &str, generation: u64, message: &str) {
        if self.debug {
            info!(role = %self.role, channel_arn = %self.channel_arn, peer_id, generation, "{message}");
        } else {
            debug!(role = %self.role, channel_arn = %self.channel_arn, peer_id, generation, "{message}");
        }
    }

    /// For peers that have no registry record yet.
    pub(crate) fn peer_note(&self, peer_id: &str, message: &str) {
        if self.debug {
            info!(role = %self.role, channel_arn = %self.channel_arn, peer_id, "{message}");
        } else {
            debug!(role = %self.role, channel_arn = %self.channel_arn, peer_id, "{message}");
        }
    }

    pub(crate) fn peer_error(&self, peer_id: &str, err: &SessionError) {
        warn!(
            role = %self.role,
            channel_arn = %self.channel_arn,
            peer_id,
            kind = err.kind(),
            error = %err,
            "peer error"
        );
    }

    pub(crate) fn session_error(&self, err: &SessionError) {
        error!(
            role = %self.role,
            channel_arn = %self.channel_arn,
            kind = err.kind(),
            error = %err,
            "session error"
        );
    }
}
