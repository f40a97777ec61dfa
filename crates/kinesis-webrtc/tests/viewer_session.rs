mod common;

use std::sync::Arc;

use kinesis_webrtc::mock::{
    MockChannelService, MockMediaDevices, MockPeerConnection, MockPeerConnectionFactory,
    MockPeerFailures, MockServices, MockSignalingConfigService, MockSignalingTransport,
};
use kinesis_webrtc::rtc::{IceCandidate, SessionDescription, TransceiverDirection};
use kinesis_webrtc::signaling::{OutboundSignal, SignalingEvent};
use kinesis_webrtc::{
    start_viewer, ChannelRole, DependencyError, MediaConstraints, MediaError, ProtocolError,
    ServiceError, SessionError, TrackKind, ViewerConfig, ViewerPhase, ViewerSession,
};

use common::{eventually, settle, viewer_config, within, CHANNEL_ARN, REGION};

async fn offering_viewer(
    mocks: &MockServices,
    config: ViewerConfig,
) -> (ViewerSession, Arc<MockSignalingTransport>, Arc<MockPeerConnection>) {
    let session = start_viewer(config, mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;
    let connection = within("connection", mocks.peer_connections.wait_for_created(1)).await;
    transport.emit(SignalingEvent::Open);
    eventually("offer sent", || transport.sent_of("sdp_offer").len() == 1).await;
    (session, transport, connection)
}

fn answer() -> SignalingEvent {
    SignalingEvent::SdpAnswer {
        description: SessionDescription::answer("v=0 answer from master"),
        sender_client_id: None,
    }
}

async fn wait_for_error(session: &ViewerSession) -> SessionError {
    within("error", session.wait_for(|state| state.error.is_some()))
        .await
        .and_then(|state| state.error)
        .expect("error surfaced")
}

#[tokio::test]
async fn returns_local_media() {
    let mocks = MockServices::new();
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");

    let state = within("local media", session.wait_for(|state| state.local_media.is_some()))
        .await
        .expect("session alive");
    assert_eq!(state.local_media.map(|media| media.tracks().len()), Some(2));
    assert_eq!(mocks.media_devices.calls(), 1);
    session.dispose().await;
}

#[tokio::test]
async fn dispose_stops_local_media() {
    let mocks = MockServices::new();
    let (session, _transport, _connection) = offering_viewer(&mocks, viewer_config()).await;

    session.dispose().await;
    let tracks = mocks.media_devices.produced_tracks();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(|track| track.stop_count() == 1));
}

#[tokio::test]
async fn dispose_closes_signaling_and_connection() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;
    let updates = session.subscribe();

    session.dispose().await;

    assert_eq!(transport.close_count(), 1);
    assert_eq!(transport.listener_count(), 0);
    assert_eq!(connection.close_count(), 1);
    assert_eq!(connection.listener_count(), 0);
    let last = updates.borrow().clone();
    assert_eq!(last.phase, ViewerPhase::Closed);
    assert!(last.peer.connection.is_none());
    assert!(last.peer.media.is_none());
}

#[tokio::test]
async fn opens_signaling_with_viewer_identity() {
    let mocks = MockServices::new();
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;

    eventually("opened", || transport.open_count() == 1).await;
    let config = transport.config();
    assert_eq!(config.role, ChannelRole::Viewer);
    assert_eq!(config.channel_endpoint, MockChannelService::WSS);
    assert_eq!(config.client_id.as_deref(), Some(session.client_id()));
    assert!(!session.client_id().is_empty());
    assert_eq!(
        mocks.channels.requests(),
        vec![(CHANNEL_ARN.to_string(), ChannelRole::Viewer)]
    );
    session.dispose().await;
}

#[tokio::test]
async fn configured_client_id_is_kept() {
    let mocks = MockServices::new();
    let session = start_viewer(viewer_config().with_client_id("viewer-7"), mocks.services())
        .expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;

    assert_eq!(session.client_id(), "viewer-7");
    assert_eq!(session.state().peer.id, "viewer-7");
    assert_eq!(transport.config().client_id.as_deref(), Some("viewer-7"));
    session.dispose().await;
}

#[tokio::test]
async fn sends_offer_with_local_tracks() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    assert_eq!(connection.added_tracks().len(), 2);
    assert!(connection.transceivers().is_empty());
    assert_eq!(connection.offer_count(), 1);
    let offer = &transport.sent_of("sdp_offer")[0];
    assert_eq!(offer.recipient, None);
    assert!(matches!(offer.signal, OutboundSignal::SdpOffer(_)));

    let state = within(
        "awaiting answer",
        session.wait_for(|state| state.phase == ViewerPhase::AwaitingAnswer),
    )
    .await
    .expect("session alive");
    assert!(state.peer.connection.is_some());
    session.dispose().await;
}

#[tokio::test]
async fn offer_waits_for_signaling_open() {
    let mocks = MockServices::new();
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;
    within("connection", mocks.peer_connections.wait_for_created(1)).await;
    settle().await;
    assert!(transport.sent_of("sdp_offer").is_empty());

    transport.emit(SignalingEvent::Open);
    eventually("offer sent", || transport.sent_of("sdp_offer").len() == 1).await;
    session.dispose().await;
}

#[tokio::test]
async fn creates_exactly_one_peer_connection() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    transport.emit(answer());
    eventually("answer applied", || connection.remote_descriptions().len() == 1).await;
    transport.emit(answer());
    transport.emit(SignalingEvent::IceCandidate {
        candidate: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 50000 typ host")),
        sender_client_id: None,
    });
    transport.emit(SignalingEvent::Open);
    settle().await;

    assert_eq!(mocks.peer_connections.count(), 1);
    assert_eq!(connection.remote_descriptions().len(), 1);
    assert_eq!(transport.sent_of("sdp_offer").len(), 1);
    assert!(session.state().error.is_none());
    session.dispose().await;
}

#[tokio::test]
async fn back_to_back_answers_apply_once() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    transport.emit(answer());
    transport.emit(answer());
    transport.emit(SignalingEvent::IceCandidate {
        candidate: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 50000 typ host")),
        sender_client_id: None,
    });
    eventually("candidate applied", || connection.remote_candidates().len() == 1).await;
    settle().await;

    assert_eq!(connection.remote_descriptions().len(), 1);
    assert!(session.state().error.is_none());
    session.dispose().await;
}

#[tokio::test]
async fn buffers_remote_candidates_until_answer() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    transport.emit(SignalingEvent::IceCandidate {
        candidate: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 50000 typ host")),
        sender_client_id: None,
    });
    settle().await;
    assert!(connection.remote_candidates().is_empty());

    transport.emit(answer());
    eventually("candidate applied", || connection.remote_candidates().len() == 1).await;
    session.dispose().await;
}

#[tokio::test]
async fn forwards_local_candidates() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    connection.emit_ice_candidate("candidate:1 1 udp 2122260223 10.0.0.9 50000 typ host");
    eventually("candidate sent", || transport.sent_of("ice_candidate").len() == 1).await;
    assert_eq!(transport.sent_of("ice_candidate")[0].recipient, None);
    session.dispose().await;
}

#[tokio::test]
async fn exposes_remote_media() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;
    transport.emit(answer());

    let remote = connection.emit_track(TrackKind::Video, "master-stream");
    let state = within(
        "connected",
        session.wait_for(|state| state.phase == ViewerPhase::Connected),
    )
    .await
    .expect("session alive");
    let media = state.peer.media.expect("remote media");
    assert_eq!(media.id(), "master-stream");

    session.dispose().await;
    assert_eq!(remote.stop_count(), 1);
}

#[tokio::test]
async fn viewer_only_adds_receive_only_transceiver() {
    let mocks = MockServices::new();
    let config = ViewerConfig::new(CHANNEL_ARN, REGION, common::credentials())
        .with_media(MediaConstraints::none());
    let (session, _transport, connection) = offering_viewer(&mocks, config).await;

    assert_eq!(
        connection.transceivers(),
        vec![(TrackKind::Video, TransceiverDirection::RecvOnly)]
    );
    assert!(connection.added_tracks().is_empty());
    assert_eq!(mocks.media_devices.calls(), 0);
    assert!(session.state().local_media.is_none());
    session.dispose().await;
}

#[tokio::test]
async fn viewer_without_media_config_is_receive_only() {
    let mocks = MockServices::new();
    let config = ViewerConfig::new(CHANNEL_ARN, REGION, common::credentials());
    let (session, _transport, connection) = offering_viewer(&mocks, config).await;

    assert_eq!(connection.transceivers().len(), 1);
    assert_eq!(mocks.media_devices.calls(), 0);
    session.dispose().await;
}

#[tokio::test]
async fn connection_waits_for_local_media() {
    let mocks = MockServices::new();
    let gate = mocks.media_devices.hold();
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");

    within("ice lookup", mocks.signaling_config.wait_for_calls(1)).await;
    settle().await;
    assert_eq!(mocks.peer_connections.count(), 0);

    gate.release();
    let connection = within("connection", mocks.peer_connections.wait_for_created(1)).await;
    eventually("tracks added", || connection.added_tracks().len() == 2).await;
    session.dispose().await;
}

#[tokio::test]
async fn media_error_surfaces() {
    let mut mocks = MockServices::new();
    mocks.media_devices = Arc::new(MockMediaDevices::failing(MediaError::NotFound(
        "no camera".into(),
    )));
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");

    let err = wait_for_error(&session).await;
    assert_eq!(
        err,
        SessionError::Dependency(DependencyError::LocalMedia(MediaError::NotFound(
            "no camera".into()
        )))
    );
    assert_eq!(session.state().phase, ViewerPhase::Failed);
    assert_eq!(mocks.peer_connections.count(), 0);
    session.dispose().await;
}

#[tokio::test]
async fn endpoint_error_surfaces() {
    let mut mocks = MockServices::new();
    mocks.channels = Arc::new(MockChannelService::failing(ServiceError::Transport(
        "dns".into(),
    )));
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");

    let err = wait_for_error(&session).await;
    assert!(matches!(
        err,
        SessionError::Dependency(DependencyError::Endpoints(_))
    ));
    session.dispose().await;
}

#[tokio::test]
async fn ice_error_surfaces() {
    let mut mocks = MockServices::new();
    mocks.signaling_config = Arc::new(MockSignalingConfigService::with_response(None));
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");

    let err = wait_for_error(&session).await;
    assert_eq!(
        err,
        SessionError::Dependency(DependencyError::IceServersResponseMissing)
    );
    let transport = mocks.signaling.last().expect("transport");
    assert_eq!(transport.close_count(), 1);
    session.dispose().await;
}

#[tokio::test]
async fn signaling_error_surfaces_and_tears_down() {
    let mocks = MockServices::new();
    let (session, transport, connection) = offering_viewer(&mocks, viewer_config()).await;

    transport.emit(SignalingEvent::Error("closed by peer".into()));
    let err = wait_for_error(&session).await;
    assert_eq!(
        err,
        SessionError::Dependency(DependencyError::Signaling("closed by peer".into()))
    );
    let state = session.state();
    assert!(state.peer.connection.is_none());
    assert!(state.local_media.is_none());
    assert_eq!(transport.close_count(), 1);
    assert_eq!(connection.close_count(), 1);
    assert!(mocks
        .media_devices
        .produced_tracks()
        .iter()
        .all(|track| track.stop_count() == 1));
    session.dispose().await;
}

#[tokio::test]
async fn set_local_description_failure_is_distinct_from_missing() {
    let mut mocks = MockServices::new();
    mocks.peer_connections = Arc::new(MockPeerConnectionFactory::with_failures(MockPeerFailures {
        set_local_description: true,
        ..Default::default()
    }));
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;
    transport.emit(SignalingEvent::Open);
    let err = wait_for_error(&session).await;
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::SetLocalDescription(_))
    ));
    session.dispose().await;

    let mut mocks = MockServices::new();
    mocks.peer_connections = Arc::new(MockPeerConnectionFactory::with_failures(MockPeerFailures {
        missing_local_description: true,
        ..Default::default()
    }));
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;
    transport.emit(SignalingEvent::Open);
    let err = wait_for_error(&session).await;
    assert_eq!(
        err,
        SessionError::Protocol(ProtocolError::LocalDescriptionMissing)
    );
    session.dispose().await;
}

#[tokio::test]
async fn remote_candidate_before_connection_is_a_contract_error() {
    let mocks = MockServices::new();
    let _gate = mocks.signaling_config.hold();
    let session = start_viewer(viewer_config(), mocks.services()).expect("valid config");
    let transport = within("signaling transport", mocks.signaling.wait_for_transport()).await;

    transport.emit(SignalingEvent::IceCandidate {
        candidate: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 50000 typ host")),
        sender_client_id: None,
    });
    let err = wait_for_error(&session).await;
    assert_eq!(
        err,
        SessionError::Protocol(ProtocolError::PeerConnectionNotInitialized)
    );
    session.dispose().await;
}

#[tokio::test]
async fn empty_remote_candidate_is_a_contract_error() {
    let mocks = MockServices::new();
    let (session, transport, _connection) = offering_viewer(&mocks, viewer_config()).await;

    transport.emit(SignalingEvent::IceCandidate {
        candidate: None,
        sender_client_id: None,
    });
    let err = wait_for_error(&session).await;
    assert_eq!(err, SessionError::Protocol(ProtocolError::IceCandidateMissing));
    session.dispose().await;
}
