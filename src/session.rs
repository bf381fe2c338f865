//! Negotiation state machine for one two-party call.
//!
//! A [`Session`] owns the single peer connection of the call and is the only
//! thing that mutates it. Three sources feed it: messages from the relay,
//! events reported by the transport (negotiation needed, local candidates,
//! inbound tracks, connectivity) and commands from [`SessionHandle`]s. They
//! are handled one at a time on the session's own loop, so every handler
//! sees a consistent state when it starts, and re-reads transport state
//! after each suspension.
//!
//! Handlers never fail outward. A failed step is logged, counted in
//! [`SessionStats`] and published as a [`SessionEvent`], and the loop goes on.

use crate::commands::{SessionCommand, SessionHandle};
use crate::config::{Config, NegotiationConfig};
use crate::error::{Error, Result};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::media::{LocalStream, MediaSource, RemoteStream, RemoteTrack, TrackKind};
use crate::peer::ice::{CandidateInbox, CandidateOutcome, DropReason};
use crate::peer::state::{
    ConnectionState, NegotiationStage, NegotiationState, Role, SessionStats,
};
use crate::peer::transport::{Connector, PeerTransport, SenderInfo, Subscription, TransportEvent};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use crate::signaling::SignalMessage;
use crate::switcher::TrackSwitcher;
use crate::utils::random_id;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;
/// Re-offer delay window after two offers tie.
const TIE_RETRY_MS: std::ops::Range<u64> = 50..500;

/// What the session reports to the rendering layer and to tests.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LocalStreamChanged(Option<LocalStream>),
    /// First inbound stream; fired once.
    RemoteStreamAvailable(RemoteStream),
    RemoteTrackAdded(RemoteTrack),
    StateChanged(NegotiationState),
    RoleAssigned(Role),
    ConnectionStateChanged(ConnectionState),
    ScreenShareChanged { sharing: bool },
    NegotiationFailed { stage: NegotiationStage, error: String },
    CandidateDropped { reason: DropReason },
    /// Both sides offered at once; `kept_local` tells which offer survived here.
    OfferCollision { kept_local: bool },
}

struct Connection {
    transport: Arc<dyn PeerTransport>,
    _subscription: Subscription,
}

pub struct Session {
    participant_id: String,
    negotiation: NegotiationConfig,
    turn_configured: bool,
    connector: Arc<dyn Connector>,
    outbound: mpsc::Sender<SignalMessage>,
    events: mpsc::Sender<SessionEvent>,
    connection: Option<Connection>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands_tx: mpsc::Sender<SessionCommand>,
    commands_rx: mpsc::Receiver<SessionCommand>,
    state: NegotiationState,
    role: Option<Role>,
    /// Bumped whenever tracks are attached to the connection.
    tracks_generation: u64,
    /// Track generation covered by the last local description.
    described_generation: u64,
    /// Set once the first offer/answer exchange completes; roles are fixed from then on.
    first_round_done: bool,
    /// When to offer again after a collision neither side could win.
    offer_retry: Option<Instant>,
    inbox: CandidateInbox,
    switcher: TrackSwitcher,
    remote_streams: Vec<RemoteStream>,
    local_candidates: Vec<IceCandidate>,
    transport_connected: bool,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        media: Arc<dyn MediaSource>,
        outbound: mpsc::Sender<SignalMessage>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let session = Self {
            participant_id: random_id(),
            negotiation: config.negotiation.clone(),
            turn_configured: config.has_turn_server(),
            connector,
            outbound,
            events,
            connection: None,
            transport_tx,
            transport_rx,
            commands_tx,
            commands_rx,
            state: NegotiationState::Idle,
            role: None,
            tracks_generation: 0,
            described_generation: 0,
            first_round_done: false,
            offer_retry: None,
            inbox: CandidateInbox::new(config.negotiation.early_candidates),
            switcher: TrackSwitcher::new(media),
            remote_streams: Vec::new(),
            local_candidates: Vec::new(),
            transport_connected: false,
            stats: SessionStats::default(),
        };
        (session, events_rx)
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn remote_streams(&self) -> &[RemoteStream] {
        &self.remote_streams
    }

    pub fn is_sharing(&self) -> bool {
        self.switcher.is_sharing()
    }

    pub fn current_local_stream(&self) -> Option<LocalStream> {
        self.switcher.current_local_stream()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.commands_tx.clone(), self.switcher.local_view())
    }

    /// Acquire the camera, then announce ourselves in the room.
    pub async fn start(&mut self) -> Result<()> {
        let camera = self.switcher.open_camera().await?;
        self.emit(SessionEvent::LocalStreamChanged(Some(camera)));
        info!(participant = %self.participant_id, "joining room");
        self.send(SignalMessage::Join(true)).await
    }

    /// Drive the session until the relay closes the channel.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<SignalMessage>) -> SessionStats {
        loop {
            let share_ended = self.switcher.ended_signal();
            let retry_at = self.offer_retry;
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_signal(msg).await,
                    None => {
                        info!(participant = %self.participant_id, "signaling channel closed");
                        break;
                    }
                },
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
                Some(command) = self.commands_rx.recv() => self.handle_command(command).await,
                generation = share_ended => self.on_share_ended(generation).await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_offer().await
                }
            }
        }
        self.close().await;
        self.stats
    }

    /// Handle every transport event queued so far. Returns how many were handled.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.transport_rx.try_recv() {
            self.handle_transport_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_signal(&mut self, msg: SignalMessage) {
        debug!(kind = msg.kind(), state = %self.state, "signal received");
        match msg {
            SignalMessage::Join(true) => self.on_remote_joined().await,
            SignalMessage::Join(false) => debug!("ignoring join=false"),
            SignalMessage::Offer(desc) => {
                if desc.sdp_type == SdpType::Offer {
                    self.on_offer_received(desc).await
                } else {
                    self.fail(NegotiationStage::ApplyOffer, unexpected_type(&desc));
                }
            }
            SignalMessage::Answer(desc) => {
                if desc.sdp_type == SdpType::Answer {
                    self.on_answer_received(desc).await
                } else {
                    self.fail(NegotiationStage::ApplyAnswer, unexpected_type(&desc));
                }
            }
            SignalMessage::IceCandidate(candidate) => self.on_candidate_received(candidate).await,
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            TransportEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            TransportEvent::RemoteTrack { track, streams } => {
                self.on_remote_track_arrived(track, streams)
            }
            TransportEvent::ConnectionState(state) => {
                self.on_connection_state(state);
                self.renegotiate_if_uncovered().await;
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ToggleScreenShare { enable, reply } => {
                let _ = reply.send(self.toggle_screen_share(enable).await);
            }
            SessionCommand::SetTrackEnabled { kind, enabled } => {
                info!(%kind, enabled, "local track toggled");
                self.switcher.set_enabled(kind, enabled);
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            SessionCommand::Senders { reply } => {
                let _ = reply.send(self.senders().await);
            }
        }
    }

    /// A participant joined the room after us: we offer.
    pub async fn on_remote_joined(&mut self) {
        if self.connection.is_none() && self.role.is_none() {
            self.assign_role(Role::Offerer);
        }
        if !self.ensure_connection().await {
            return;
        }
        // The offer itself goes out from `on_negotiation_needed`.
        self.attach_local_tracks().await;
    }

    /// The transport wants a new offer. Coalesced: a track generation already
    /// covered by a local description produces nothing.
    pub async fn on_negotiation_needed(&mut self) {
        if self.connection.is_none() {
            return;
        }
        if self.tracks_generation <= self.described_generation {
            debug!(generation = self.tracks_generation, "negotiation already covered");
            return;
        }
        if !self.state.can_offer() {
            debug!(state = %self.state, "renegotiation deferred until the current round ends");
            return;
        }
        self.send_offer().await;
    }

    pub async fn on_offer_received(&mut self, offer: SessionDescription) {
        if self.state == NegotiationState::OfferSent && !self.resolve_collision(&offer).await {
            return;
        }

        // Whoever answers the first round is the answerer; later rounds keep roles.
        if !self.first_round_done {
            self.assign_role(Role::Answerer);
        }
        if !self.ensure_connection().await {
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };

        if let Err(e) = transport.set_remote_description(offer).await {
            self.fail(NegotiationStage::ApplyOffer, e);
            return;
        }
        self.set_state(NegotiationState::OfferReceived);
        self.flush_candidates(transport.as_ref()).await;
        self.attach_local_tracks().await;

        let generation = self.tracks_generation;
        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(NegotiationStage::CreateAnswer, e);
                return;
            }
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            self.fail(NegotiationStage::CreateAnswer, e);
            return;
        }
        if answer_covers(&answer, &transport.senders().await) {
            self.described_generation = generation;
        } else {
            // Senders the offer had no section for go out in our own offer once stable.
            info!("answer leaves local tracks unsent, offering them after this round");
            self.described_generation = generation.saturating_sub(1);
        }

        if let Err(e) = self.send(SignalMessage::Answer(answer)).await {
            self.fail(NegotiationStage::Send, e);
            return;
        }
        self.stats.answers_sent += 1;
        self.set_state(NegotiationState::AnswerExchanged);
        self.maybe_stable();
        self.renegotiate_if_uncovered().await;
    }

    pub async fn on_answer_received(&mut self, answer: SessionDescription) {
        let Some(transport) = self.transport() else {
            warn!("answer without a connection");
            self.fail(NegotiationStage::ApplyAnswer, Error::NoConnection);
            return;
        };
        if self.state != NegotiationState::OfferSent {
            warn!(state = %self.state, "answer without an outstanding offer");
            self.fail(
                NegotiationStage::ApplyAnswer,
                Error::InvalidDescription(format!("answer received in state {}", self.state)),
            );
            return;
        }

        if let Err(e) = transport.set_remote_description(answer).await {
            self.fail(NegotiationStage::ApplyAnswer, e);
            return;
        }
        self.set_state(NegotiationState::AnswerExchanged);
        self.flush_candidates(transport.as_ref()).await;
        self.maybe_stable();
        self.renegotiate_if_uncovered().await;
    }

    /// Offer again once stable if tracks were attached that no description
    /// has carried yet: added while our offer was in flight, or left out of
    /// an answer.
    async fn renegotiate_if_uncovered(&mut self) {
        if self.state == NegotiationState::Stable
            && self.tracks_generation > self.described_generation
        {
            info!(generation = self.tracks_generation, "renegotiating for unsent tracks");
            self.send_offer().await;
        }
    }

    /// Senders of the current connection with the tracks they feed.
    pub async fn senders(&self) -> Vec<SenderInfo> {
        match self.transport() {
            Some(transport) => transport.senders().await,
            None => Vec::new(),
        }
    }

    /// Never fails: early or rejected candidates are dropped (or buffered) and reported.
    pub async fn on_candidate_received(&mut self, candidate: IceCandidate) {
        let transport = self.transport();
        let outcome = self.inbox.accept(transport.as_deref(), candidate).await;
        self.record_candidate_outcome(outcome);
    }

    pub async fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            analyze_candidates(&self.local_candidates, self.turn_configured);
            return;
        };
        dump_candidate("local", &candidate);
        self.local_candidates.push(candidate.clone());
        match self.send(SignalMessage::IceCandidate(candidate)).await {
            Ok(()) => self.stats.candidates_sent += 1,
            Err(e) => self.fail(NegotiationStage::Send, e),
        }
    }

    pub fn on_remote_track_arrived(&mut self, track: RemoteTrack, streams: Vec<String>) {
        let stream_id = streams
            .into_iter()
            .next()
            .unwrap_or_else(|| track.stream_id.clone());
        info!(track = %track.id, kind = %track.kind, stream = %stream_id, "remote track");
        self.emit(SessionEvent::RemoteTrackAdded(track.clone()));

        let first = self.remote_streams.is_empty();
        match self.remote_streams.iter_mut().find(|s| s.id == stream_id) {
            Some(stream) => stream.tracks.push(track),
            None => self.remote_streams.push(RemoteStream {
                id: stream_id,
                tracks: vec![track],
            }),
        }
        if first {
            if let Some(stream) = self.remote_streams.first() {
                self.emit(SessionEvent::RemoteStreamAvailable(stream.clone()));
            }
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) {
        info!(?state, negotiation = %self.state, "connection state");
        self.emit(SessionEvent::ConnectionStateChanged(state));
        match state {
            ConnectionState::Connected => {
                self.transport_connected = true;
                self.maybe_stable();
            }
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
                self.transport_connected = false;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// `Ok(())` whatever the previous state was, unless the screen could not be acquired.
    pub async fn toggle_screen_share(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.enable_screen_share().await
        } else {
            self.disable_screen_share().await;
            Ok(())
        }
    }

    pub async fn enable_screen_share(&mut self) -> Result<()> {
        let transport = self.transport();
        match self.switcher.enable_screen_share(transport.as_deref()).await {
            Ok(true) => {
                self.emit(SessionEvent::ScreenShareChanged { sharing: true });
                self.emit(SessionEvent::LocalStreamChanged(
                    self.switcher.current_local_stream(),
                ));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(error = %e, "screen share not started");
                self.emit(SessionEvent::ScreenShareChanged { sharing: false });
                Err(e)
            }
        }
    }

    /// Returns `false` (and touches nothing) when no share is active.
    pub async fn disable_screen_share(&mut self) -> bool {
        let transport = self.transport();
        let stopped = self
            .switcher
            .disable_screen_share(transport.as_deref())
            .await;
        if stopped {
            self.announce_share_stopped();
        }
        stopped
    }

    async fn on_share_ended(&mut self, generation: u64) {
        let transport = self.transport();
        if self
            .switcher
            .handle_share_ended(generation, transport.as_deref())
            .await
        {
            self.announce_share_stopped();
        }
    }

    fn announce_share_stopped(&mut self) {
        self.emit(SessionEvent::ScreenShareChanged { sharing: false });
        self.emit(SessionEvent::LocalStreamChanged(
            self.switcher.current_local_stream(),
        ));
    }

    /// Returns whether the incoming offer should be processed.
    async fn resolve_collision(&mut self, remote: &SessionDescription) -> bool {
        let Some(transport) = self.transport() else {
            return true;
        };
        let local = match transport.local_description().await {
            Some(local) if local.sdp_type == SdpType::Offer => local,
            _ => return true,
        };

        if !self.negotiation.glare_resolution {
            warn!("offer collision with resolution disabled, dropping remote offer");
            self.fail(
                NegotiationStage::ApplyOffer,
                Error::Transport("offer collision".into()),
            );
            return false;
        }

        self.stats.collisions_resolved += 1;
        match local.collision_priority(remote) {
            Ordering::Greater => {
                info!("offer collision: keeping our offer");
                self.emit(SessionEvent::OfferCollision { kept_local: true });
                return false;
            }
            Ordering::Equal => {
                // The peer sees the same tie. Both withdraw and re-offer after a
                // random delay; whichever offer lands first gets answered.
                let delay = Duration::from_millis(rand::random_range(TIE_RETRY_MS));
                warn!(?delay, "offer collision with identical offers, retrying");
                self.emit(SessionEvent::OfferCollision { kept_local: false });
                if let Err(e) = transport.rollback().await {
                    self.fail(NegotiationStage::Rollback, e);
                    return false;
                }
                self.set_state(NegotiationState::ConnectionCreated);
                self.offer_retry = Some(Instant::now() + delay);
                return false;
            }
            Ordering::Less => {}
        }

        info!("offer collision: rolling back our offer and answering");
        self.emit(SessionEvent::OfferCollision { kept_local: false });
        if let Err(e) = transport.rollback().await {
            self.fail(NegotiationStage::Rollback, e);
            return false;
        }
        self.set_state(NegotiationState::ConnectionCreated);
        true
    }

    /// Fires after a tied collision. Skipped if the peer's offer arrived first.
    async fn retry_offer(&mut self) {
        self.offer_retry = None;
        if self.state == NegotiationState::ConnectionCreated {
            self.send_offer().await;
        }
    }

    async fn send_offer(&mut self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let generation = self.tracks_generation;

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(NegotiationStage::CreateOffer, e);
                return;
            }
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            self.fail(NegotiationStage::CreateOffer, e);
            return;
        }
        self.described_generation = generation;

        if let Err(e) = self.send(SignalMessage::Offer(offer)).await {
            self.fail(NegotiationStage::Send, e);
            return;
        }
        self.stats.offers_sent += 1;
        self.set_state(NegotiationState::OfferSent);
    }

    async fn ensure_connection(&mut self) -> bool {
        if self.connection.is_some() {
            return true;
        }
        match self.connector.connect().await {
            Ok(transport) => {
                let subscription = transport.subscribe(self.transport_tx.clone());
                self.connection = Some(Connection {
                    transport,
                    _subscription: subscription,
                });
                self.stats.connections_created += 1;
                self.set_state(NegotiationState::ConnectionCreated);
                true
            }
            Err(e) => {
                self.fail(NegotiationStage::CreateConnection, e);
                false
            }
        }
    }

    /// Attach outgoing tracks whose kind has no sender yet.
    async fn attach_local_tracks(&mut self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let present: HashSet<TrackKind> = transport
            .senders()
            .await
            .iter()
            .filter_map(|s| s.kind())
            .collect();

        let mut attached = 0;
        for track in self.switcher.outgoing_tracks() {
            if present.contains(&track.kind()) {
                continue;
            }
            match transport.add_track(&track).await {
                Ok(sender) => {
                    debug!(track = %track.id(), kind = %track.kind(), sender = sender.0, "track attached");
                    attached += 1;
                }
                Err(e) => self.fail(NegotiationStage::AttachTracks, e),
            }
        }
        if attached > 0 {
            self.tracks_generation += 1;
        }
    }

    async fn flush_candidates(&mut self, transport: &dyn PeerTransport) {
        for outcome in self.inbox.flush(transport).await {
            self.record_candidate_outcome(outcome);
        }
    }

    fn record_candidate_outcome(&mut self, outcome: CandidateOutcome) {
        if outcome.is_premature() {
            self.stats.premature_candidates += 1;
            if self.stats.premature_candidates == self.negotiation.premature_candidate_warn_threshold {
                warn!(
                    count = self.stats.premature_candidates,
                    "repeated candidates before the remote description, check signaling order"
                );
            }
        }
        match outcome {
            CandidateOutcome::Applied => self.stats.candidates_applied += 1,
            CandidateOutcome::Buffered => debug!("remote candidate buffered"),
            CandidateOutcome::Dropped(reason) => {
                debug!(%reason, "remote candidate dropped");
                self.stats.candidates_dropped += 1;
                self.emit(SessionEvent::CandidateDropped { reason });
            }
        }
    }

    fn maybe_stable(&mut self) {
        if self.state == NegotiationState::AnswerExchanged && self.transport_connected {
            self.set_state(NegotiationState::Stable);
            if self.stats.stable_at.is_none() {
                self.stats.stable_at = Some(Utc::now());
            }
        }
    }

    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.connection.as_ref().map(|c| Arc::clone(&c.transport))
    }

    fn assign_role(&mut self, role: Role) {
        if self.role != Some(role) {
            info!(?role, participant = %self.participant_id, "role assigned");
            self.role = Some(role);
            self.emit(SessionEvent::RoleAssigned(role));
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        if state == NegotiationState::AnswerExchanged {
            self.first_round_done = true;
        }
        if self.state != state {
            debug!(from = %self.state, to = %state, "negotiation state");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn fail(&mut self, stage: NegotiationStage, error: Error) {
        warn!(%stage, error = %error, state = %self.state, "negotiation step failed");
        self.stats.negotiation_failures += 1;
        self.emit(SessionEvent::NegotiationFailed {
            stage,
            error: error.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "session event dropped");
        }
    }

    async fn send(&self, msg: SignalMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::SignalingClosed)
    }

    async fn close(&mut self) {
        self.switcher.disable_screen_share(None).await;
        if let Some(camera) = self.switcher.camera() {
            camera.stop_all();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.transport.close().await {
                debug!(error = %e, "closing peer connection");
            }
        }
    }
}

/// Every sender with a track has a sending section of its kind in `answer`.
fn answer_covers(answer: &SessionDescription, senders: &[SenderInfo]) -> bool {
    let sending = answer.sending_media_kinds();
    [TrackKind::Audio, TrackKind::Video].into_iter().all(|kind| {
        let needed = senders.iter().filter(|s| s.kind() == Some(kind)).count();
        let label = kind.to_string();
        sending.iter().filter(|k| **k == label).count() >= needed
    })
}

fn unexpected_type(desc: &SessionDescription) -> Error {
    Error::InvalidDescription(format!("unexpected type {:?}", desc.sdp_type))
}
