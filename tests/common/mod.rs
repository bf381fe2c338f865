#![allow(dead_code)]

use roomcall_lib::media::{SyntheticMediaSource, TrackKind};
use roomcall_lib::peer::connection::RtcConnector;
use roomcall_lib::peer::state::{NegotiationState, Role, SessionStats};
use roomcall_lib::peer::{Connector, SimulatedConnector, SimulatedTransport};
use roomcall_lib::signaling::{LoopbackRelay, SignalMessage};
use roomcall_lib::{Config, Session, SessionEvent, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);
/// Host-candidate ICE and DTLS over loopback.
const RTC_WAIT: Duration = Duration::from_secs(20);

/// A member of a loopback room whose session has not started yet.
pub struct Entered {
    session: Session,
    inbound: mpsc::Receiver<SignalMessage>,
    events: mpsc::Receiver<SessionEvent>,
    connector: Option<SimulatedConnector>,
    wait: Duration,
    started: bool,
}

async fn enter_with(
    relay: &LoopbackRelay,
    room: &str,
    config: &Config,
    connector: Arc<dyn Connector>,
    media: SyntheticMediaSource,
) -> (Session, mpsc::Receiver<SignalMessage>, mpsc::Receiver<SessionEvent>) {
    let (outbound, inbound) = relay.join(room).await.unwrap().split();
    let (session, events) = Session::new(config, connector, Arc::new(media), outbound);
    (session, inbound, events)
}

pub async fn enter(
    relay: &LoopbackRelay,
    room: &str,
    connector: SimulatedConnector,
    media: SyntheticMediaSource,
) -> Entered {
    let (session, inbound, events) = enter_with(
        relay,
        room,
        &Config::default(),
        Arc::new(connector.clone()),
        media,
    )
    .await;
    Entered {
        session,
        inbound,
        events,
        connector: Some(connector),
        wait: WAIT,
        started: false,
    }
}

/// Same as [`enter`] over real webrtc-rs peer connections with no ICE servers.
pub async fn enter_rtc(
    relay: &LoopbackRelay,
    room: &str,
    config: &Config,
    media: SyntheticMediaSource,
) -> Entered {
    let connector = Arc::new(RtcConnector::new(Vec::new()));
    let (session, inbound, events) =
        enter_with(relay, room, config, connector, media.with_samples()).await;
    Entered {
        session,
        inbound,
        events,
        connector: None,
        wait: RTC_WAIT,
        started: false,
    }
}

impl Entered {
    /// Announce ourselves and put our own offer on the wire before reading
    /// anything from the room. Two members doing this both sit in
    /// `OfferSent` with the other's offer queued behind its join.
    pub async fn offer_first(&mut self) {
        self.session.start().await.unwrap();
        self.started = true;
        self.session.on_remote_joined().await;
        let deadline = tokio::time::Instant::now() + self.wait;
        while self.session.state() != NegotiationState::OfferSent {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no offer was sent, state {}",
                self.session.state()
            );
            self.session.pump().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn start(mut self) -> Participant {
        if !self.started {
            self.session.start().await.unwrap();
        }
        let handle = self.session.handle();
        let task = tokio::spawn(self.session.run(self.inbound));
        Participant {
            connector: self.connector,
            handle,
            events: self.events,
            seen: Vec::new(),
            wait: self.wait,
            task,
        }
    }
}

pub async fn join(relay: &LoopbackRelay, room: &str, connector: SimulatedConnector) -> Participant {
    enter(relay, room, connector, SyntheticMediaSource::new())
        .await
        .start()
        .await
}

/// Simulated participant with its own capture devices.
pub async fn join_with(relay: &LoopbackRelay, room: &str, media: SyntheticMediaSource) -> Participant {
    enter(relay, room, SimulatedConnector::new(), media)
        .await
        .start()
        .await
}

/// Lets spawned relay and session tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub struct Participant {
    connector: Option<SimulatedConnector>,
    pub handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    seen: Vec<SessionEvent>,
    wait: Duration,
    pub task: JoinHandle<SessionStats>,
}

impl Participant {
    /// The in-memory connector; only for participants made by [`enter`] or [`join`].
    pub fn sim(&self) -> &SimulatedConnector {
        self.connector
            .as_ref()
            .expect("participant runs on a real peer connection")
    }

    pub fn transport(&self) -> Arc<SimulatedTransport> {
        self.sim().last().expect("no peer connection was created")
    }

    /// Waits until an event matching `pred` has been seen, including earlier ones.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        if let Some(event) = self.seen.iter().find(|e| pred(e)) {
            return event.clone();
        }
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("session event channel closed");
            self.seen.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_stable(&mut self) {
        self.wait_for(|e| matches!(e, SessionEvent::StateChanged(NegotiationState::Stable)))
            .await;
    }

    /// Waits until `Stable` has been entered `rounds` times.
    pub async fn wait_stable_rounds(&mut self, rounds: usize) {
        let deadline = tokio::time::Instant::now() + self.wait;
        while self.count(|e| matches!(e, SessionEvent::StateChanged(NegotiationState::Stable))) < rounds {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for a stable round")
                .expect("session event channel closed");
            self.seen.push(event);
        }
    }

    /// Every event received so far, after pulling whatever is queued.
    pub fn events(&mut self) -> &[SessionEvent] {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    pub fn count(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// Negotiation states in the order they were entered.
    pub fn states(&mut self) -> Vec<NegotiationState> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn role(&mut self) -> Option<Role> {
        self.events().iter().rev().find_map(|e| match e {
            SessionEvent::RoleAssigned(role) => Some(*role),
            _ => None,
        })
    }

    pub async fn stats(&self) -> SessionStats {
        self.handle.stats().await.unwrap()
    }

    /// Id of the track currently fed into the video sender.
    pub async fn sent_video(&self) -> Option<String> {
        self.handle
            .senders()
            .await
            .unwrap()
            .into_iter()
            .find_map(|s| s.track.filter(|(_, kind)| *kind == TrackKind::Video))
            .map(|(id, _)| id)
    }
}

/// Two participants in `room`: the second arrives after the first one's join went nowhere.
pub async fn connected_pair(room: &str) -> (LoopbackRelay, Participant, Participant) {
    let relay = LoopbackRelay::new();
    let mut first = join(&relay, room, SimulatedConnector::new()).await;
    settle().await;
    let mut second = join(&relay, room, SimulatedConnector::new()).await;
    first.wait_stable().await;
    second.wait_stable().await;
    (relay, first, second)
}
