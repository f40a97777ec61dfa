//! Signaling channel contract and the session wrapper controllers hold.

use std::sync::Arc;

use tracing::debug;

use crate::config::Credentials;
use crate::endpoints::ChannelRole;
use crate::error::{ConfigurationError, DependencyError, SessionError, SignalingError, StateError};
use crate::listeners::{Handler, ListenerId};
use crate::rtc::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Open,
    Close,
    Error(String),
    SdpOffer {
        description: SessionDescription,
        sender_client_id: Option<String>,
    },
    SdpAnswer {
        description: SessionDescription,
        sender_client_id: Option<String>,
    },
    IceCandidate {
        candidate: Option<IceCandidate>,
        sender_client_id: Option<String>,
    },
}

pub type SignalingHandler = Handler<SignalingEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    SdpOffer(SessionDescription),
    SdpAnswer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl OutboundSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundSignal::SdpOffer(_) => "sdp_offer",
            OutboundSignal::SdpAnswer(_) => "sdp_answer",
            OutboundSignal::IceCandidate(_) => "ice_candidate",
        }
    }
}

/// Raw signaling channel primitive. Sends only enqueue; delivery failures
/// come back as `SignalingEvent::Error`.
pub trait SignalingTransport: Send + Sync {
    fn open(&self);
    fn close(&self);
    fn subscribe(&self, handler: SignalingHandler) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId);
    fn send_sdp_offer(
        &self,
        description: &SessionDescription,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError>;
    fn send_sdp_answer(
        &self,
        description: &SessionDescription,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError>;
    fn send_ice_candidate(
        &self,
        candidate: &IceCandidate,
        recipient_client_id: Option<&str>,
    ) -> Result<(), SignalingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingClientConfig {
    pub channel_arn: String,
    pub channel_endpoint: String,
    pub role: ChannelRole,
    pub region: String,
    pub client_id: Option<String>,
    pub credentials: Credentials,
    pub system_clock_offset_ms: i64,
}

pub trait SignalingTransportFactory: Send + Sync {
    fn create(
        &self,
        config: SignalingClientConfig,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructed,
    Opened,
    Closed,
}

/// One signaling connection for one role and identity. Never reopened once
/// closed; errors reported by the transport are forwarded but do not close it.
pub struct SignalingSession {
    transport: Arc<dyn SignalingTransport>,
    role: ChannelRole,
    client_id: Option<String>,
    listener: Option<ListenerId>,
    lifecycle: Lifecycle,
}

impl SignalingSession {
    pub fn connect(
        factory: &dyn SignalingTransportFactory,
        config: SignalingClientConfig,
        handler: SignalingHandler,
    ) -> Result<Self, SessionError> {
        if config.role == ChannelRole::Viewer
            && config.client_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigurationError::ClientIdMissing.into());
        }
        let role = config.role;
        let client_id = config.client_id.clone();
        let transport = factory
            .create(config)
            .map_err(|err| DependencyError::Signaling(err.to_string()))?;
        let listener = transport.subscribe(handler);
        Ok(Self {
            transport,
            role,
            client_id,
            listener: Some(listener),
            lifecycle: Lifecycle::Constructed,
        })
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_opened(&self) -> bool {
        self.lifecycle == Lifecycle::Opened
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    pub fn open(&mut self) -> Result<(), StateError> {
        match self.lifecycle {
            Lifecycle::Constructed => {
                debug!(role = %self.role, "opening signaling session");
                self.transport.open();
                self.lifecycle = Lifecycle::Opened;
                Ok(())
            }
            Lifecycle::Opened => Ok(()),
            Lifecycle::Closed => Err(StateError::SessionClosed),
        }
    }

    /// Idempotent. Removes the listener and closes the transport.
    pub fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        if let Some(listener) = self.listener.take() {
            self.transport.unsubscribe(listener);
        }
        self.transport.close();
        self.lifecycle = Lifecycle::Closed;
        debug!(role = %self.role, "signaling session closed");
    }

    pub fn send(
        &self,
        signal: &OutboundSignal,
        peer_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        if self.lifecycle == Lifecycle::Closed {
            return Err(SignalingError::Closed);
        }
        match signal {
            OutboundSignal::SdpOffer(description) => {
                self.transport.send_sdp_offer(description, peer_id)
            }
            OutboundSignal::SdpAnswer(description) => {
                self.transport.send_sdp_answer(description, peer_id)
            }
            OutboundSignal::IceCandidate(candidate) => {
                self.transport.send_ice_candidate(candidate, peer_id)
            }
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.close();
    }
}
