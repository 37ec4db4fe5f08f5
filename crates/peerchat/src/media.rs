//! Local media acquisition
//!
//! Capture devices sit behind [`MediaSource`]. The session only needs a
//! handle to the acquired tracks so it can attach them to the connection,
//! toggle them and release them on teardown.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("{0} device unavailable")]
    Unavailable(TrackKind),
    #[error("permission denied")]
    PermissionDenied,
    #[error("no media could be acquired")]
    NoMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// One local track. Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }
}

/// Tracks acquired for one session
#[derive(Debug, Clone, Default)]
pub struct MediaHandle {
    tracks: Vec<MediaTrack>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Mute/unmute audio or turn the camera on/off. Returns false when no track of that kind exists.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.store(enabled, Ordering::Relaxed);
            found = true;
        }
        found
    }

    /// Release every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.live.store(false, Ordering::Relaxed);
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open tracks of all requested kinds, or none of them
    async fn open(&self, kinds: &[TrackKind]) -> Result<Vec<MediaTrack>, MediaError>;
}

#[async_trait]
impl<T: MediaSource + ?Sized> MediaSource for Arc<T> {
    async fn open(&self, kinds: &[TrackKind]) -> Result<Vec<MediaTrack>, MediaError> {
        (**self).open(kinds).await
    }
}

/// Acquire local media, falling back to audio-only when video is unavailable
///
/// Asking for neither kind asks for video.
pub async fn acquire_local_media(
    source: &dyn MediaSource,
    want_video: bool,
    want_audio: bool,
) -> Result<MediaHandle, MediaError> {
    let want_video = want_video || !want_audio;
    let mut kinds = Vec::with_capacity(2);
    if want_video {
        kinds.push(TrackKind::Video);
    }
    if want_audio {
        kinds.push(TrackKind::Audio);
    }

    match source.open(&kinds).await {
        Ok(tracks) => Ok(MediaHandle::new(tracks)),
        Err(e) if want_video && want_audio => {
            warn!("video+audio unavailable ({}), falling back to audio only", e);
            match source.open(&[TrackKind::Audio]).await {
                Ok(tracks) => {
                    info!("acquired audio-only media");
                    Ok(MediaHandle::new(tracks))
                }
                Err(e) => {
                    warn!("audio-only media unavailable: {}", e);
                    Err(MediaError::NoMedia)
                }
            }
        }
        Err(e) => {
            warn!("media unavailable: {}", e);
            Err(MediaError::NoMedia)
        }
    }
}

/// Source producing placeholder tracks without touching devices, for
/// data-only sessions and headless hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMedia;

#[async_trait]
impl MediaSource for NullMedia {
    async fn open(&self, kinds: &[TrackKind]) -> Result<Vec<MediaTrack>, MediaError> {
        Ok(kinds
            .iter()
            .map(|k| MediaTrack::new(*k, format!("null-{}", k)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMedia;

    #[tokio::test]
    async fn test_acquires_both() {
        let media = acquire_local_media(&MockMedia::new(), true, true).await.unwrap();
        assert!(media.has(TrackKind::Video));
        assert!(media.has(TrackKind::Audio));
    }

    #[tokio::test]
    async fn test_falls_back_to_audio_only() {
        let source = MockMedia::new().without(TrackKind::Video);
        let media = acquire_local_media(&source, true, true).await.unwrap();
        assert!(!media.has(TrackKind::Video));
        assert!(media.has(TrackKind::Audio));
    }

    #[tokio::test]
    async fn test_fails_without_any_media() {
        let source = MockMedia::new().without(TrackKind::Video).without(TrackKind::Audio);
        assert_eq!(
            acquire_local_media(&source, true, true).await.unwrap_err(),
            MediaError::NoMedia
        );
    }

    #[tokio::test]
    async fn test_video_only_does_not_fall_back() {
        let source = MockMedia::new().without(TrackKind::Video);
        assert!(acquire_local_media(&source, true, false).await.is_err());
    }

    #[tokio::test]
    async fn test_nothing_requested_means_video() {
        let media = acquire_local_media(&MockMedia::new(), false, false).await.unwrap();
        assert!(media.has(TrackKind::Video));
        assert!(!media.has(TrackKind::Audio));
    }

    #[test]
    fn test_toggle_and_stop() {
        let media = MediaHandle::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ]);
        assert!(media.set_enabled(TrackKind::Video, false));
        assert!(!media.tracks()[1].is_enabled());
        assert!(media.tracks()[0].is_enabled());

        let clone = media.clone();
        media.stop();
        assert!(clone.tracks().iter().all(|t| !t.is_live()));

        let audio_only = MediaHandle::new(vec![MediaTrack::new(TrackKind::Audio, "mic")]);
        assert!(!audio_only.set_enabled(TrackKind::Video, true));
    }
}
