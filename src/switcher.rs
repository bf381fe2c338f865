//! Camera / screen-capture substitution on the outgoing video sender.
//!
//! The switcher never adds senders. It only replaces the track feeding the
//! one video sender the connection already has, so a switch needs no new
//! offer/answer round. Without a connection the swap only changes which
//! tracks will be attached later and what the local preview shows.

use crate::error::{Error, Result};
use crate::media::{Device, LocalStream, LocalTrack, MediaSource, TrackKind, TrackState};
use crate::peer::transport::{PeerTransport, SenderId};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct ActiveShare {
    generation: u64,
    stream: LocalStream,
}

pub struct TrackSwitcher {
    media: Arc<dyn MediaSource>,
    camera: Option<LocalStream>,
    active: Option<ActiveShare>,
    generation: u64,
    local_view: watch::Sender<Option<LocalStream>>,
}

impl TrackSwitcher {
    pub fn new(media: Arc<dyn MediaSource>) -> Self {
        let (local_view, _) = watch::channel(None);
        Self {
            media,
            camera: None,
            active: None,
            generation: 0,
            local_view,
        }
    }

    /// Observable self-view: the camera stream, or the screen stream while sharing.
    pub fn local_view(&self) -> watch::Receiver<Option<LocalStream>> {
        self.local_view.subscribe()
    }

    pub fn current_local_stream(&self) -> Option<LocalStream> {
        self.local_view.borrow().clone()
    }

    pub fn camera(&self) -> Option<&LocalStream> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&LocalStream> {
        self.active.as_ref().map(|share| &share.stream)
    }

    pub fn is_sharing(&self) -> bool {
        self.active.is_some()
    }

    pub async fn open_camera(&mut self) -> Result<LocalStream> {
        let stream = self.media.open_camera().await?;
        info!(stream = %stream.id(), tracks = stream.tracks().len(), "camera acquired");
        if let Some(old) = self.camera.replace(stream.clone()) {
            old.stop_all();
        }
        if self.active.is_none() {
            self.local_view.send_replace(Some(stream.clone()));
        }
        Ok(stream)
    }

    /// Tracks to attach to a fresh connection: camera audio plus the current video source.
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let Some(camera) = &self.camera else {
            return Vec::new();
        };
        let mut tracks: Vec<LocalTrack> = camera.audio_tracks().cloned().collect();
        let video = match &self.active {
            Some(share) => share.stream.first_video(),
            None => camera.first_video(),
        };
        tracks.extend(video.cloned());
        tracks
    }

    /// Start sharing. Returns `Ok(false)` when a share was already active.
    /// On error nothing changed: the camera keeps feeding the sender.
    pub async fn enable_screen_share(
        &mut self,
        transport: Option<&dyn PeerTransport>,
    ) -> Result<bool> {
        if self.active.is_some() {
            debug!("screen share already active");
            return Ok(false);
        }

        let stream = self.media.open_screen().await?;
        let Some(video) = stream.first_video().cloned() else {
            stream.stop_all();
            return Err(Error::Acquisition {
                device: Device::Screen,
                reason: "capture has no video track".into(),
            });
        };

        if let Some(transport) = transport {
            if let Some(sender) = video_sender(transport).await {
                if let Err(e) = transport.replace_track(sender, Some(&video)).await {
                    stream.stop_all();
                    return Err(e);
                }
            } else {
                debug!("no outgoing video sender yet, screen will be attached on connect");
            }
        }

        self.generation += 1;
        info!(stream = %stream.id(), generation = self.generation, "screen share started");
        self.local_view.send_replace(Some(stream.clone()));
        self.active = Some(ActiveShare {
            generation: self.generation,
            stream,
        });
        Ok(true)
    }

    /// Stop sharing and put the camera back. Returns `false` if nothing was shared.
    pub async fn disable_screen_share(&mut self, transport: Option<&dyn PeerTransport>) -> bool {
        let Some(share) = self.active.take() else {
            return false;
        };
        share.stream.stop_all();

        let camera_video = self.camera.as_ref().and_then(|c| c.first_video()).cloned();
        if let Some(transport) = transport {
            match video_sender(transport).await {
                Some(sender) => {
                    if let Err(e) = transport.replace_track(sender, camera_video.as_ref()).await {
                        warn!(error = %e, "could not restore camera track");
                    }
                }
                None => debug!("no outgoing video sender to restore"),
            }
        }

        info!(generation = share.generation, "screen share stopped");
        self.local_view.send_replace(self.camera.clone());
        true
    }

    /// Resolves with the share generation once the shared video track stops
    /// being live. Pending forever while nothing is shared.
    pub fn ended_signal(&self) -> BoxFuture<'static, u64> {
        let Some(share) = &self.active else {
            return Box::pin(std::future::pending());
        };
        let generation = share.generation;
        let Some(mut state) = share.stream.first_video().map(LocalTrack::watch_state) else {
            return Box::pin(std::future::pending());
        };
        Box::pin(async move {
            let _ = state.wait_for(|s| *s != TrackState::Live).await;
            generation
        })
    }

    /// React to [`ended_signal`](Self::ended_signal). Stale generations are ignored,
    /// so an external end tears the share down exactly once.
    pub async fn handle_share_ended(
        &mut self,
        generation: u64,
        transport: Option<&dyn PeerTransport>,
    ) -> bool {
        if self.active.as_ref().map(|share| share.generation) != Some(generation) {
            return false;
        }
        info!(generation, "screen capture ended by the source");
        self.disable_screen_share(transport).await
    }

    /// Mute / unmute the camera tracks of `kind`; the shared screen follows video.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(camera) = &self.camera {
            camera.set_enabled(kind, enabled);
        }
        if let Some(share) = &self.active {
            share.stream.set_enabled(kind, enabled);
        }
    }
}

/// The one sender currently fed by a video track. Re-read on every call since
/// the sender list may have changed while we were suspended.
async fn video_sender(transport: &dyn PeerTransport) -> Option<SenderId> {
    transport
        .senders()
        .await
        .into_iter()
        .find(|s| s.kind() == Some(TrackKind::Video))
        .map(|s| s.id)
}
