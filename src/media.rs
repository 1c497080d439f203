//! Local capture as a managed resource
//!
//! Streams are acquired explicitly and released by stopping every track.
//! Mute and video-off are track-level `enabled` toggles only; a stream is
//! never reacquired for a toggle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::types::MediaKind;

/// Errors raised while acquiring or driving local capture
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to the device
    #[error("permission to capture denied")]
    PermissionDenied,

    /// The requested device does not exist
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),

    /// The platform capture pipeline failed
    #[error("capture failure: {0}")]
    CaptureFailure(String),
}

/// One live capture track (one mic, one camera, or one screen)
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped_tx: watch::Sender<bool>,
}

impl LocalTrack {
    /// Create a live, enabled track
    #[must_use]
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped_tx,
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether the track is currently transmitting
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip transmission on or off; a no-op on a stopped track
    pub fn set_enabled(&self, enabled: bool) {
        if self.is_stopped() {
            return;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether capture has ended
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    /// End capture. Idempotent; a stopped track never un-stops.
    pub fn stop(&self) {
        if !self.is_stopped() {
            debug!(track = %self.id, "stopping capture track");
            let _ = self.stopped_tx.send(true);
        }
    }

    /// Observe the stop signal, e.g. a screen share ended outside the app
    #[must_use]
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stopped_tx.subscribe()
    }
}

/// A set of tracks acquired together
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    /// Assemble a stream from its tracks
    #[must_use]
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks in the stream
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    /// Video tracks only
    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    /// Toggle every audio track
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Toggle every video track
    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.video_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track. Idempotent.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires local capture from the platform
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Request mic-only (`Audio`) or camera+mic (`Video`) capture
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError>;

    /// Request screen capture
    async fn acquire_display(&self) -> Result<LocalStream, MediaError>;
}

/// In-process capture source fabricating silent/blank tracks
///
/// Stands in where no hardware is attached (tests, headless runs). Real
/// deployments implement [`MediaSource`] over the platform capture APIs.
pub struct SyntheticMediaSource {
    counter: AtomicU64,
}

impl SyntheticMediaSource {
    /// Create a synthetic source
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        let mut tracks = vec![Arc::new(LocalTrack::new(
            self.next_id("mic"),
            MediaKind::Audio,
        ))];
        if kind.has_video() {
            tracks.push(Arc::new(LocalTrack::new(
                self.next_id("cam"),
                MediaKind::Video,
            )));
        }
        Ok(LocalStream::new(self.next_id("stream"), tracks))
    }

    async fn acquire_display(&self) -> Result<LocalStream, MediaError> {
        let track = Arc::new(LocalTrack::new(self.next_id("screen"), MediaKind::Video));
        Ok(LocalStream::new(self.next_id("display"), vec![track]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audio_acquisition_is_mic_only() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire(MediaKind::Audio).await.unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 0);
    }

    #[tokio::test]
    async fn test_video_acquisition_includes_mic() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire(MediaKind::Video).await.unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
    }

    #[tokio::test]
    async fn test_toggle_flips_enabled_only() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire(MediaKind::Video).await.unwrap();
        stream.set_audio_enabled(false);
        assert!(stream.audio_tracks().all(|t| !t.is_enabled()));
        assert!(stream.video_tracks().all(|t| t.is_enabled()));
        stream.set_audio_enabled(true);
        assert!(stream.audio_tracks().all(|t| t.is_enabled()));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire(MediaKind::Audio).await.unwrap();
        stream.stop();
        stream.stop();
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
        // A stopped track ignores toggles
        stream.set_audio_enabled(false);
        stream.set_audio_enabled(true);
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_stop_signal_observable() {
        let track = Arc::new(LocalTrack::new("screen-0", MediaKind::Video));
        let mut stopped = track.stopped();
        assert!(!*stopped.borrow());
        track.stop();
        stopped.changed().await.unwrap();
        assert!(*stopped.borrow());
    }
}
