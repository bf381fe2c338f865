//! Generated capture devices for the CLI and tests.

use super::{Device, LocalStream, LocalTrack, MediaSource, TrackKind, TrackState};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

// Opus silence frame.
static SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
// VP8 keyframe header of a 2x2 image; payload content does not matter to the transport.
static BLANK_FRAME: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x02, 0x00, 0x02, 0x00];

/// Media source producing Opus silence and blank VP8 frames.
pub struct SyntheticMediaSource {
    camera_available: bool,
    camera_video: bool,
    screen_available: bool,
    emit_samples: bool,
    counter: AtomicU64,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self {
            camera_available: true,
            camera_video: true,
            screen_available: true,
            emit_samples: false,
            counter: AtomicU64::new(0),
        }
    }

    /// Write samples into live, enabled tracks (needed when a real peer is on the other side).
    pub fn with_samples(mut self) -> Self {
        self.emit_samples = true;
        self
    }

    /// Simulate a denied camera permission.
    pub fn without_camera(mut self) -> Self {
        self.camera_available = false;
        self
    }

    /// Microphone only: the camera stream carries no video track.
    pub fn audio_only(mut self) -> Self {
        self.camera_video = false;
        self
    }

    /// Simulate the user cancelling the screen picker.
    pub fn without_screen(mut self) -> Self {
        self.screen_available = false;
        self
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn track(&self, kind: TrackKind, device: Device, stream_id: &str) -> LocalTrack {
        let (mime_type, clock_rate, channels, frame) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, 48000, 2, AUDIO_FRAME),
            TrackKind::Video => (MIME_TYPE_VP8, 90000, 0, VIDEO_FRAME),
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            self.next_id(&kind.to_string()),
            stream_id.to_string(),
        ));

        let track = LocalTrack::new(kind, device, rtc.clone());
        if self.emit_samples {
            tokio::spawn(pump_samples(track.clone(), rtc, frame));
        }
        track
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn open_camera(&self) -> Result<LocalStream> {
        if !self.camera_available {
            return Err(Error::Acquisition {
                device: Device::Camera,
                reason: "permission denied".into(),
            });
        }
        let stream_id = self.next_id("camera");
        let mut tracks = vec![self.track(TrackKind::Audio, Device::Camera, &stream_id)];
        if self.camera_video {
            tracks.push(self.track(TrackKind::Video, Device::Camera, &stream_id));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }

    async fn open_screen(&self) -> Result<LocalStream> {
        if !self.screen_available {
            return Err(Error::Acquisition {
                device: Device::Screen,
                reason: "cancelled by user".into(),
            });
        }
        let stream_id = self.next_id("screen");
        let tracks = vec![self.track(TrackKind::Video, Device::Screen, &stream_id)];
        Ok(LocalStream::new(stream_id, tracks))
    }
}

async fn pump_samples(track: LocalTrack, rtc: Arc<TrackLocalStaticSample>, frame: Duration) {
    let payload = match track.kind() {
        TrackKind::Audio => Bytes::from_static(&SILENCE),
        TrackKind::Video => Bytes::from_static(&BLANK_FRAME),
    };
    let mut state = track.watch_state();
    let mut ticker = tokio::time::interval(frame);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !track.is_enabled() {
                    continue;
                }
                let sample = Sample {
                    data: payload.clone(),
                    duration: frame,
                    ..Default::default()
                };
                if let Err(e) = rtc.write_sample(&sample).await {
                    debug!(track = %track.id(), error = %e, "sample write failed");
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != TrackState::Live {
                    break;
                }
            }
        }
    }
    debug!(track = %track.id(), "sample pump stopped");
}
