use std::sync::Arc;

use tokio::sync::watch;

use crate::endpoints::ChannelService;
use crate::ice::SignalingConfigService;
use crate::media::MediaDevices;
use crate::rtc::PeerConnectionFactory;
use crate::signaling::SignalingTransportFactory;

/// Collaborator handles a controller owns for its whole lifetime.
#[derive(Clone)]
pub struct SessionServices {
    pub channels: Arc<dyn ChannelService>,
    pub signaling_config: Arc<dyn SignalingConfigService>,
    pub signaling: Arc<dyn SignalingTransportFactory>,
    pub peer_connections: Arc<dyn PeerConnectionFactory>,
    pub media_devices: Arc<dyn MediaDevices>,
}

/// Waits until `predicate` holds for the published state. Returns `None`
/// if the controller stopped without ever satisfying it.
pub async fn wait_for_state<S: Clone>(
    receiver: &mut watch::Receiver<S>,
    mut predicate: impl FnMut(&S) -> bool,
) -> Option<S> {
    loop {
        {
            let current = receiver.borrow_and_update();
            if predicate(&current) {
                return Some(current.clone());
            }
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow();
            return predicate(&last).then(|| last.clone());
        }
    }
}
