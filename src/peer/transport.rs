//! Seam between the negotiation state machine and a peer connection implementation.

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::state::ConnectionState;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something the transport reports on its own schedule.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The outgoing track set changed and a new offer is wanted.
    NegotiationNeeded,
    /// A local candidate was gathered; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    /// Inbound track with the ids of the remote streams it belongs to.
    RemoteTrack {
        track: RemoteTrack,
        streams: Vec<String>,
    },
    ConnectionState(ConnectionState),
}

/// Handle returned by [`PeerTransport::subscribe`]. Dropping it detaches the callbacks.
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> (Self, EventSink) {
        let active = Arc::new(AtomicBool::new(true));
        let sink = EventSink {
            tx,
            active: Arc::clone(&active),
        };
        (Self { active }, sink)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Transport-side end of a [`Subscription`], cloned into every callback.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    active: Arc<AtomicBool>,
}

impl EventSink {
    /// Returns `false` once the subscription is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.active.load(Ordering::Acquire) && self.tx.send(event).is_ok()
    }
}

/// Index of an RTP sender in the connection's sender list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: SenderId,
    /// `(track id, kind)` of the track currently fed into the sender.
    pub track: Option<(String, TrackKind)>,
}

impl SenderInfo {
    pub fn kind(&self) -> Option<TrackKind> {
        self.track.as_ref().map(|(_, kind)| *kind)
    }

    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|(id, _)| id.as_str())
    }
}

/// One peer connection. All methods may suspend; callers re-read state afterwards.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Wire the transport callbacks to `tx`. Called once, right after creation.
    fn subscribe(&self, tx: mpsc::UnboundedSender<TransportEvent>) -> Subscription;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Discard a local offer that has not been answered.
    async fn rollback(&self) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    /// Fails when no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId>;

    async fn senders(&self) -> Vec<SenderInfo>;

    /// Swap the track feeding `sender` without renegotiating.
    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections. ICE servers are fixed at construction.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PeerTransport>>;
}
