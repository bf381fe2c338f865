//! In-memory peer connection.
//!
//! Models the signaling-state rules of a real peer connection (offer/answer
//! ordering, rollback, candidates rejected before the remote description)
//! without any networking, so negotiation can be driven end to end in tests.
//! Two simulated transports "connect" as soon as both of their descriptions
//! are applied.

use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::state::ConnectionState;
use crate::peer::transport::{
    Connector, EventSink, PeerTransport, SenderId, SenderInfo, Subscription, TransportEvent,
};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

const HOST_CANDIDATE: &str = "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host";

/// Build a minimal SDP body listing `tracks` as `msid` attributes.
pub fn offer_sdp(session_id: u64, tracks: &[LocalTrack]) -> String {
    build_sdp(session_id, 1, tracks.iter().map(MediaLine::sending))
}

/// One `m=` section; `track` is `(stream id, track id)` when it sends.
struct MediaLine {
    kind: TrackKind,
    track: Option<(String, String)>,
}

impl MediaLine {
    fn sending(track: &LocalTrack) -> Self {
        Self {
            kind: track.kind(),
            track: Some((
                track.rtc_track().stream_id().to_string(),
                track.id().to_string(),
            )),
        }
    }

    fn receive_only(kind: TrackKind) -> Self {
        Self { kind, track: None }
    }
}

fn build_sdp(session_id: u64, version: u64, lines: impl Iterator<Item = MediaLine>) -> String {
    let mut sdp = format!("v=0\r\no=- {session_id} {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    for line in lines {
        sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", line.kind));
        match line.track {
            Some((stream_id, track_id)) => {
                sdp.push_str(&format!("a=sendrecv\r\na=msid:{stream_id} {track_id}\r\n"))
            }
            None => sdp.push_str("a=recvonly\r\n"),
        }
    }
    sdp
}

fn offered_kinds(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .filter_map(|media| match media.split_whitespace().next() {
            Some("audio") => Some(TrackKind::Audio),
            Some("video") => Some(TrackKind::Video),
            _ => None,
        })
        .collect()
}

fn parse_remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut ids = msid.split_whitespace();
            if let (Some(kind), Some(stream_id), Some(track_id)) = (kind, ids.next(), ids.next()) {
                tracks.push(RemoteTrack {
                    id: track_id.to_string(),
                    kind,
                    stream_id: stream_id.to_string(),
                    remote: None,
                });
            }
        }
    }
    tracks
}

#[derive(Debug, Default)]
struct Faults {
    connect: AtomicBool,
    create_offer: AtomicBool,
    create_answer: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    next_session_id: AtomicU64,
    faults: Arc<Faults>,
    transports: Mutex<Vec<Arc<SimulatedTransport>>>,
}

/// Hands out [`SimulatedTransport`]s and keeps them for inspection.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    shared: Arc<Shared>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::with_session_id(rand::random::<u32>() as u64 + 1)
    }

    /// Fix the SDP origin session id of the first transport; later ones count up.
    pub fn with_session_id(first: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                next_session_id: AtomicU64::new(first),
                faults: Arc::default(),
                transports: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.shared.faults.connect.store(fail, Ordering::Relaxed);
    }

    pub fn fail_create_offer(&self, fail: bool) {
        self.shared.faults.create_offer.store(fail, Ordering::Relaxed);
    }

    pub fn fail_create_answer(&self, fail: bool) {
        self.shared.faults.create_answer.store(fail, Ordering::Relaxed);
    }

    pub fn connect_simulated(&self) -> Arc<SimulatedTransport> {
        let session_id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(SimulatedTransport::new(
            session_id,
            Arc::clone(&self.shared.faults),
        ));
        lock(&self.shared.transports).push(Arc::clone(&transport));
        transport
    }

    pub fn transports(&self) -> Vec<Arc<SimulatedTransport>> {
        lock(&self.shared.transports).clone()
    }

    pub fn last(&self) -> Option<Arc<SimulatedTransport>> {
        lock(&self.shared.transports).last().cloned()
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerTransport>> {
        if self.shared.faults.connect.load(Ordering::Relaxed) {
            return Err(Error::Transport("connection refused".into()));
        }
        Ok(self.connect_simulated())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct Inner {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    /// Local description to restore when an unanswered offer is rolled back.
    stable_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<Option<LocalTrack>>,
    applied: Vec<IceCandidate>,
    announced: HashSet<String>,
    version: u64,
    gathered: bool,
    connected: bool,
    closed: bool,
}

/// See the module docs.
#[derive(Debug)]
pub struct SimulatedTransport {
    session_id: u64,
    faults: Arc<Faults>,
    inner: Mutex<Inner>,
    sink: Mutex<Option<EventSink>>,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    replacements: AtomicUsize,
}

impl SimulatedTransport {
    fn new(session_id: u64, faults: Arc<Faults>) -> Self {
        Self {
            session_id,
            faults,
            inner: Mutex::new(Inner {
                signaling: SignalingState::Stable,
                local: None,
                stable_local: None,
                remote: None,
                senders: Vec::new(),
                applied: Vec::new(),
                announced: HashSet::new(),
                version: 0,
                gathered: false,
                connected: false,
                closed: false,
            }),
            sink: Mutex::new(None),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            replacements: AtomicUsize::new(0),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).applied.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::Relaxed)
    }

    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::Relaxed)
    }

    /// Number of `replace_track` calls.
    pub fn replacements(&self) -> usize {
        self.replacements.load(Ordering::Relaxed)
    }

    /// Tracks currently fed into the senders, by sender index.
    pub fn sender_tracks(&self) -> Vec<Option<LocalTrack>> {
        lock(&self.inner).senders.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    fn emit(&self, events: Vec<TransportEvent>) {
        let sink = lock(&self.sink).clone();
        let Some(sink) = sink else {
            return;
        };
        for event in events {
            trace!(session_id = self.session_id, ?event, "simulated transport event");
            sink.emit(event);
        }
    }

    fn describe_offer(&self, inner: &mut Inner) -> String {
        inner.version += 1;
        let lines: Vec<MediaLine> = inner.senders.iter().flatten().map(MediaLine::sending).collect();
        build_sdp(self.session_id, inner.version, lines.into_iter())
    }

    /// An answer mirrors the offer's sections. A sender only goes out on a
    /// section of its own kind; the rest wait for an offer of ours.
    fn describe_answer(&self, inner: &mut Inner) -> String {
        inner.version += 1;
        let offered = inner
            .remote
            .as_ref()
            .map(|offer| offered_kinds(&offer.sdp))
            .unwrap_or_default();
        let mut unsent: Vec<&LocalTrack> = inner.senders.iter().flatten().collect();
        let lines: Vec<MediaLine> = offered
            .into_iter()
            .map(|kind| match unsent.iter().position(|track| track.kind() == kind) {
                Some(index) => MediaLine::sending(unsent.remove(index)),
                None => MediaLine::receive_only(kind),
            })
            .collect();
        build_sdp(self.session_id, inner.version, lines.into_iter())
    }

    fn connect_if_ready(inner: &mut Inner, events: &mut Vec<TransportEvent>) {
        if inner.connected || inner.local.is_none() || inner.remote.is_none() {
            return;
        }
        inner.connected = true;
        events.push(TransportEvent::ConnectionState(ConnectionState::Connecting));
        events.push(TransportEvent::ConnectionState(ConnectionState::Connected));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_sdp(desc: &SessionDescription) -> Result<()> {
    if desc.sdp.starts_with("v=0") {
        Ok(())
    } else {
        Err(Error::InvalidDescription("missing version line".into()))
    }
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    fn subscribe(&self, tx: mpsc::UnboundedSender<TransportEvent>) -> Subscription {
        let (subscription, sink) = Subscription::new(tx);
        *lock(&self.sink) = Some(sink);
        subscription
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.faults.create_offer.load(Ordering::Relaxed) {
            return Err(Error::Transport("injected create_offer failure".into()));
        }
        let mut inner = lock(&self.inner);
        if inner.signaling == SignalingState::HaveRemoteOffer {
            return Err(Error::Transport("cannot offer in have-remote-offer".into()));
        }
        self.offers_created.fetch_add(1, Ordering::Relaxed);
        Ok(SessionDescription::offer(self.describe_offer(&mut inner)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.faults.create_answer.load(Ordering::Relaxed) {
            return Err(Error::Transport("injected create_answer failure".into()));
        }
        let mut inner = lock(&self.inner);
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Transport("no remote offer to answer".into()));
        }
        self.answers_created.fetch_add(1, Ordering::Relaxed);
        Ok(SessionDescription::answer(self.describe_answer(&mut inner)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let mut events = Vec::new();
        {
            let mut inner = lock(&self.inner);
            match (desc.sdp_type, inner.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    check_sdp(&desc)?;
                    inner.stable_local = inner.local.take();
                    inner.local = Some(desc);
                    inner.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    check_sdp(&desc)?;
                    inner.local = Some(desc);
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    check_sdp(&desc)?;
                    inner.local = Some(desc);
                    inner.stable_local = None;
                    inner.signaling = SignalingState::Stable;
                }
                (sdp_type, state) => {
                    return Err(Error::Transport(format!(
                        "cannot apply local {sdp_type:?} in {state:?}"
                    )));
                }
            }

            if !inner.gathered {
                inner.gathered = true;
                events.push(TransportEvent::LocalCandidate(Some(IceCandidate::new(
                    HOST_CANDIDATE,
                ))));
                events.push(TransportEvent::LocalCandidate(None));
            }
            Self::connect_if_ready(&mut inner, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = lock(&self.inner);
            check_sdp(&desc)?;
            match (desc.sdp_type, inner.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    inner.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    inner.stable_local = None;
                    inner.signaling = SignalingState::Stable;
                }
                (sdp_type, state) => {
                    return Err(Error::Transport(format!(
                        "cannot apply remote {sdp_type:?} in {state:?}"
                    )));
                }
            }

            for track in parse_remote_tracks(&desc.sdp) {
                if inner.announced.insert(track.id.clone()) {
                    let streams = vec![track.stream_id.clone()];
                    events.push(TransportEvent::RemoteTrack { track, streams });
                }
            }
            inner.remote = Some(desc);
            Self::connect_if_ready(&mut inner, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.signaling != SignalingState::HaveLocalOffer {
            return Err(Error::Transport(format!(
                "nothing to roll back in {:?}",
                inner.signaling
            )));
        }
        inner.local = inner.stable_local.take();
        inner.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.remote.is_none() {
            return Err(Error::Transport("remote description is not set".into()));
        }
        inner.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let id = {
            let mut inner = lock(&self.inner);
            if inner.senders.iter().flatten().any(|t| t == track) {
                return Err(Error::Transport(format!("track {} already added", track.id())));
            }
            inner.senders.push(Some(track.clone()));
            SenderId(inner.senders.len() - 1)
        };
        self.emit(vec![TransportEvent::NegotiationNeeded]);
        Ok(id)
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        lock(&self.inner)
            .senders
            .iter()
            .enumerate()
            .map(|(i, track)| SenderInfo {
                id: SenderId(i),
                track: track.as_ref().map(|t| (t.id().to_string(), t.kind())),
            })
            .collect()
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<()> {
        let mut inner = lock(&self.inner);
        let slot = inner
            .senders
            .get_mut(sender.0)
            .ok_or_else(|| Error::Transport(format!("no sender {}", sender.0)))?;
        *slot = track.cloned();
        self.replacements.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.connected = false;
        }
        self.emit(vec![TransportEvent::ConnectionState(ConnectionState::Closed)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, SyntheticMediaSource};

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let camera = SyntheticMediaSource::new().open_camera().await.unwrap();
        let a = SimulatedConnector::with_session_id(10).connect_simulated();
        let b = SimulatedConnector::with_session_id(20).connect_simulated();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.subscribe(tx);

        for track in camera.tracks() {
            a.add_track(track).await.unwrap();
        }
        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.origin_session_id(), Some(10));
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(a.is_connected() && b.is_connected());

        let mut remote_tracks = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TransportEvent::RemoteTrack { .. }) {
                remote_tracks += 1;
            }
        }
        assert_eq!(remote_tracks, 2);
    }

    #[tokio::test]
    async fn rollback_restores_stable() {
        let t = SimulatedConnector::new().connect_simulated();
        let offer = t.create_offer().await.unwrap();
        t.set_local_description(offer).await.unwrap();
        assert!(t.local_description().await.is_some());

        t.rollback().await.unwrap();
        assert!(t.local_description().await.is_none());
        assert!(t.rollback().await.is_err());

        let remote = SessionDescription::offer(offer_sdp(5, &[]));
        t.set_remote_description(remote).await.unwrap();
    }

    #[tokio::test]
    async fn remote_offer_is_rejected_while_local_offer_pending() {
        let t = SimulatedConnector::new().connect_simulated();
        let offer = t.create_offer().await.unwrap();
        t.set_local_description(offer).await.unwrap();
        let remote = SessionDescription::offer(offer_sdp(5, &[]));
        assert!(t.set_remote_description(remote).await.is_err());
    }

    #[tokio::test]
    async fn replace_track_does_not_request_negotiation() {
        let source = SyntheticMediaSource::new();
        let camera = source.open_camera().await.unwrap();
        let screen = source.open_screen().await.unwrap();
        let t = SimulatedConnector::new().connect_simulated();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = t.subscribe(tx);

        let video = camera.first_video().unwrap();
        let id = t.add_track(video).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::NegotiationNeeded)));

        t.replace_track(id, screen.first_video()).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(t.sender_tracks()[0].as_ref(), screen.first_video());
        assert!(t.replace_track(SenderId(9), None).await.is_err());
    }

    #[tokio::test]
    async fn injected_faults() {
        let connector = SimulatedConnector::new();
        connector.fail_create_offer(true);
        let t = connector.connect_simulated();
        assert!(t.create_offer().await.is_err());

        connector.fail_connect(true);
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.transports().len(), 1);
    }

    #[tokio::test]
    async fn answer_sends_only_on_offered_sections() {
        let camera = SyntheticMediaSource::new().open_camera().await.unwrap();
        let microphone: Vec<LocalTrack> = camera.audio_tracks().cloned().collect();
        let a = SimulatedConnector::with_session_id(10).connect_simulated();
        let b = SimulatedConnector::with_session_id(20).connect_simulated();

        let offer = SessionDescription::offer(offer_sdp(10, &microphone));
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        for track in camera.tracks() {
            b.add_track(track).await.unwrap();
        }

        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.sending_media_kinds(), vec!["audio"]);
        assert!(!answer.sdp.contains(camera.first_video().unwrap().id()));

        // The next offer from the answering side carries everything.
        b.set_local_description(answer).await.unwrap();
        let reoffer = b.create_offer().await.unwrap();
        assert_eq!(reoffer.sending_media_kinds(), vec!["audio", "video"]);
    }
}
