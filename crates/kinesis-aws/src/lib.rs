//! AWS bindings for `kinesis-webrtc`: SigV4 signing, the Kinesis Video
//! control plane clients and the signaling channel websocket.

pub mod client;
pub mod sigv4;
pub mod websocket;
pub mod wire;

use std::sync::Arc;

use kinesis_webrtc::media::MediaDevices;
use kinesis_webrtc::retry::{RetryingChannelService, RetryingSignalingConfigService};
use kinesis_webrtc::rtc::PeerConnectionFactory;
use kinesis_webrtc::{Credentials, RetryPolicy, SessionServices};

pub use client::{ClockOffset, KinesisVideoClient, SignalingChannelsClient};
pub use websocket::{WebSocketSignalingClient, WebSocketSignalingFactory};

/// Wires the AWS clients into a [`SessionServices`]. Control plane calls
/// are retried per `retry`; `client_id` is forwarded to ICE server lookups.
pub fn aws_services(
    region: &str,
    credentials: Credentials,
    client_id: Option<&str>,
    retry: RetryPolicy,
    peer_connections: Arc<dyn PeerConnectionFactory>,
    media_devices: Arc<dyn MediaDevices>,
) -> SessionServices {
    let channels = KinesisVideoClient::new(region, credentials);
    let mut signaling_config = channels.signaling_channels();
    if let Some(client_id) = client_id {
        signaling_config = signaling_config.with_client_id(client_id);
    }
    SessionServices {
        channels: Arc::new(RetryingChannelService::new(Arc::new(channels), retry)),
        signaling_config: Arc::new(RetryingSignalingConfigService::new(
            Arc::new(signaling_config),
            retry,
        )),
        signaling: Arc::new(WebSocketSignalingFactory::new()),
        peer_connections,
        media_devices,
    }
}
