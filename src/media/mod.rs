//! Local and remote media handles.
//!
//! Capture itself is an external concern: a [`MediaSource`] hands out
//! [`LocalStream`]s whose tracks wrap webrtc-rs `TrackLocal`s. The session
//! only attaches, swaps and stops them.

pub mod synthetic;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub use synthetic::SyntheticMediaSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Capture device a local track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Camera,
    Screen,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Camera => "camera",
            Self::Screen => "screen capture",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Stopped by us.
    Stopped,
    /// Ended by the source (device gone, user stopped sharing from the OS).
    Ended,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    device: Device,
    rtc: Arc<dyn TrackLocal + Send + Sync>,
    state: watch::Sender<TrackState>,
    enabled: AtomicBool,
}

/// Cheaply clonable handle to one outgoing track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, device: Device, rtc: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: rtc.id().to_string(),
                kind,
                device,
                rtc,
                state,
                enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.inner.rtc)
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    pub fn watch_state(&self) -> watch::Receiver<TrackState> {
        self.inner.state.subscribe()
    }

    /// Release the track. Returns `false` if it was no longer live.
    pub fn stop(&self) -> bool {
        self.transition(TrackState::Stopped)
    }

    /// Called by the media source when the track ends on its own.
    pub fn mark_ended(&self) -> bool {
        self.transition(TrackState::Ended)
    }

    fn transition(&self, to: TrackState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device", &self.inner.device)
            .field("state", &self.state())
            .finish()
    }
}

/// A set of local tracks captured together (camera + microphone, or a screen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn first_video(&self) -> Option<&LocalTrack> {
        self.video_tracks().next()
    }

    /// Stop every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }
}

/// Inbound track surfaced to the rendering layer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// The webrtc-rs track to read RTP from; `None` on simulated transports.
    pub remote: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

/// Capture devices, supplied by the embedding application.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Camera and microphone.
    async fn open_camera(&self) -> Result<LocalStream>;

    /// Screen capture. May fail on user cancellation or permission denial.
    async fn open_screen(&self) -> Result<LocalStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_and_end_are_one_shot() {
        let source = SyntheticMediaSource::new();
        let camera = source.open_camera().await.unwrap();
        let video = camera.first_video().unwrap().clone();

        assert!(video.is_live());
        assert!(video.stop());
        assert!(!video.stop());
        assert!(!video.mark_ended());
        assert_eq!(video.state(), TrackState::Stopped);

        assert_eq!(camera.stop_all(), 1, "only the audio track was still live");
    }

    #[tokio::test]
    async fn enabled_flag_is_per_kind() {
        let camera = SyntheticMediaSource::new().open_camera().await.unwrap();
        camera.set_enabled(TrackKind::Audio, false);
        assert!(camera.audio_tracks().all(|t| !t.is_enabled()));
        assert!(camera.video_tracks().all(|t| t.is_enabled()));
    }

    #[tokio::test]
    async fn clones_compare_equal_but_distinct_tracks_do_not() {
        let source = SyntheticMediaSource::new();
        let first = source.open_camera().await.unwrap();
        let second = source.open_camera().await.unwrap();
        let video = first.first_video().unwrap();
        assert_eq!(video, &video.clone());
        assert_ne!(video, second.first_video().unwrap());
    }
}
