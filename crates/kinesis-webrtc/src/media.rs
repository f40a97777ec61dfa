//! Local capture streams and the manager that owns them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use webrtc::track::track_local::TrackLocal;

use crate::config::MediaConstraints;
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// Must be idempotent.
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// Sending half for tracks that can be added to a `webrtc` peer connection.
    fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn from_track(stream_id: impl Into<String>, track: Arc<dyn MediaTrack>) -> Self {
        Self::new(stream_id, vec![track])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if !self.tracks.iter().any(|existing| existing.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|track| track.is_stopped())
    }
}

/// Platform capture API (`getUserMedia`).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;
}

#[derive(Default)]
struct MediaSlot {
    epoch: u64,
    disposed: bool,
    constraints: Option<MediaConstraints>,
    held: Option<MediaStream>,
}

/// Owns at most one local stream. A result that lands after `cancel` or
/// `dispose`, or after the constraints changed, has its tracks stopped and
/// is never handed out.
pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    slot: Mutex<MediaSlot>,
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            slot: Mutex::new(MediaSlot::default()),
        }
    }

    /// `Ok(None)` means nothing was requested or the acquisition was voided.
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Option<MediaStream>, MediaError> {
        let epoch = {
            let mut slot = self.slot.lock();
            if slot.disposed {
                return Ok(None);
            }
            if slot.constraints.as_ref() == Some(constraints) {
                if let Some(stream) = &slot.held {
                    return Ok(Some(stream.clone()));
                }
            }
            if let Some(previous) = slot.held.take() {
                previous.stop_all();
            }
            slot.epoch += 1;
            slot.constraints = Some(constraints.clone());
            if constraints.is_empty() {
                return Ok(None);
            }
            slot.epoch
        };

        let result = self.devices.get_user_media(constraints).await;

        let mut slot = self.slot.lock();
        let live = !slot.disposed && slot.epoch == epoch;
        match result {
            Ok(stream) if live => {
                slot.held = Some(stream.clone());
                Ok(Some(stream))
            }
            Ok(stream) => {
                drop(slot);
                debug!(stream_id = stream.id(), "local media resolved after cancel; stopping tracks");
                stream.stop_all();
                Ok(None)
            }
            Err(err) if live => Err(err),
            Err(err) => {
                debug!(error = %err, "local media failed after cancel");
                Ok(None)
            }
        }
    }

    /// Voids the in-flight acquisition, if any.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.epoch += 1;
        if slot.held.is_none() {
            slot.constraints = None;
        }
    }

    pub fn release(&self, stream: &MediaStream) {
        let mut slot = self.slot.lock();
        if slot.held.as_ref().map(MediaStream::id) == Some(stream.id()) {
            slot.held = None;
            slot.constraints = None;
        }
        drop(slot);
        stream.stop_all();
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.slot.lock().held.clone()
    }

    /// Stops the held stream and voids anything still in flight.
    pub fn dispose(&self) {
        let held = {
            let mut slot = self.slot.lock();
            slot.disposed = true;
            slot.epoch += 1;
            slot.constraints = None;
            slot.held.take()
        };
        if let Some(stream) = held {
            stream.stop_all();
        }
    }
}

impl Drop for LocalMediaManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMediaDevices;

    #[tokio::test]
    async fn acquires_once_per_constraints() {
        let devices = Arc::new(MockMediaDevices::new());
        let manager = LocalMediaManager::new(devices.clone());

        let first = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire")
            .expect("stream");
        let again = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire")
            .expect("stream");

        assert_eq!(first.id(), again.id());
        assert_eq!(first.tracks().len(), 2);
        assert_eq!(devices.calls(), 1);
    }

    #[tokio::test]
    async fn empty_constraints_never_reach_the_platform() {
        let devices = Arc::new(MockMediaDevices::new());
        let manager = LocalMediaManager::new(devices.clone());

        let stream = manager
            .acquire(&MediaConstraints::none())
            .await
            .expect("acquire");

        assert!(stream.is_none());
        assert_eq!(devices.calls(), 0);
    }

    #[tokio::test]
    async fn platform_errors_surface_as_is() {
        let devices = Arc::new(MockMediaDevices::failing(MediaError::PermissionDenied(
            "camera".into(),
        )));
        let manager = LocalMediaManager::new(devices);

        let err = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect_err("denied");
        assert_eq!(err, MediaError::PermissionDenied("camera".into()));
    }

    #[tokio::test]
    async fn changing_constraints_stops_previous_stream() {
        let devices = Arc::new(MockMediaDevices::new());
        let manager = LocalMediaManager::new(devices.clone());

        let first = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire")
            .expect("stream");
        let audio_only = MediaConstraints {
            audio: true,
            ..MediaConstraints::none()
        };
        let second = manager
            .acquire(&audio_only)
            .await
            .expect("acquire")
            .expect("stream");

        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        assert_eq!(second.tracks().len(), 1);
        assert_eq!(devices.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_acquisition_stops_late_stream() {
        let devices = Arc::new(MockMediaDevices::new());
        let gate = devices.hold();
        let manager = Arc::new(LocalMediaManager::new(devices.clone()));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&MediaConstraints::audio_video()).await })
        };
        devices.wait_for_calls(1).await;
        manager.cancel();
        gate.release();

        let result = pending.await.expect("join").expect("acquire");
        assert!(result.is_none());
        assert!(manager.current().is_none());
        let produced = devices.produced();
        assert_eq!(produced.len(), 1);
        assert!(produced[0].is_stopped());
    }

    #[tokio::test]
    async fn dispose_stops_held_tracks_once() {
        let devices = Arc::new(MockMediaDevices::new());
        let manager = LocalMediaManager::new(devices.clone());
        let stream = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire")
            .expect("stream");

        manager.dispose();
        manager.dispose();

        assert!(stream.is_stopped());
        assert!(devices.produced_tracks().iter().all(|t| t.stop_count() == 1));
        let after = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire");
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn release_stops_tracks_and_clears_slot() {
        let devices = Arc::new(MockMediaDevices::new());
        let manager = LocalMediaManager::new(devices);
        let stream = manager
            .acquire(&MediaConstraints::audio_video())
            .await
            .expect("acquire")
            .expect("stream");

        manager.release(&stream);

        assert!(stream.is_stopped());
        assert!(manager.current().is_none());
    }
}
