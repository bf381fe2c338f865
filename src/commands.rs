//! Interface the rendering layer holds on to while the session runs.

use crate::error::{Error, Result};
use crate::media::{LocalStream, TrackKind};
use crate::peer::state::SessionStats;
use crate::peer::transport::SenderInfo;
use tokio::sync::{mpsc, oneshot, watch};

/// Requests handled by the session loop, in arrival order.
#[derive(Debug)]
pub enum SessionCommand {
    ToggleScreenShare {
        enable: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Senders {
        reply: oneshot::Sender<Vec<SenderInfo>>,
    },
}

/// Cloneable handle to a running [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    local_view: watch::Receiver<Option<LocalStream>>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<SessionCommand>,
        local_view: watch::Receiver<Option<LocalStream>>,
    ) -> Self {
        Self {
            commands,
            local_view,
        }
    }

    /// Start or stop screen sharing. Fails only when the screen could not be acquired;
    /// the session is then still sending the camera.
    pub async fn toggle_screen_share(&self, enable: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ToggleScreenShare { enable, reply })
            .await?;
        rx.await.map_err(|_| Error::SessionStopped)?
    }

    /// Mute or unmute the microphone.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.send(SessionCommand::SetTrackEnabled {
            kind: TrackKind::Audio,
            enabled,
        })
        .await
    }

    /// Turn the outgoing video on or off without renegotiating.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.send(SessionCommand::SetTrackEnabled {
            kind: TrackKind::Video,
            enabled,
        })
        .await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stats { reply }).await?;
        rx.await.map_err(|_| Error::SessionStopped)
    }

    /// What each RTP sender is currently fed with. Empty before a connection exists.
    pub async fn senders(&self) -> Result<Vec<SenderInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Senders { reply }).await?;
        rx.await.map_err(|_| Error::SessionStopped)
    }

    /// Changes on camera acquisition and on every screen-share toggle.
    pub fn local_stream(&self) -> watch::Receiver<Option<LocalStream>> {
        self.local_view.clone()
    }

    pub fn current_local_stream(&self) -> Option<LocalStream> {
        self.local_view.borrow().clone()
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopped_session_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        let (_view_tx, view_rx) = watch::channel(None);
        let handle = SessionHandle::new(tx, view_rx);
        drop(rx);

        assert!(matches!(
            handle.toggle_screen_share(true).await,
            Err(Error::SessionStopped)
        ));
        assert!(matches!(
            handle.set_audio_enabled(false).await,
            Err(Error::SessionStopped)
        ));
        assert!(handle.current_local_stream().is_none());
    }

    #[tokio::test]
    async fn toggle_waits_for_the_reply() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_view_tx, view_rx) = watch::channel(None);
        let handle = SessionHandle::new(tx, view_rx);

        tokio::spawn(async move {
            if let Some(SessionCommand::ToggleScreenShare { enable, reply }) = rx.recv().await {
                assert!(enable);
                let _ = reply.send(Ok(()));
            }
        });
        handle.toggle_screen_share(true).await.unwrap();
    }
}
