use crate::config::EarlyCandidatePolicy;
use crate::peer::transport::PeerTransport;
use crate::peer::types::IceCandidate;
use std::fmt;
use tracing::debug;

/// Upper bound on candidates held back while waiting for the remote description.
const MAX_PENDING: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoConnection,
    RemoteDescriptionUnset,
    Rejected(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => f.write_str("no connection"),
            Self::RemoteDescriptionUnset => f.write_str("remote description not set"),
            Self::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
    Dropped(DropReason),
}

impl CandidateOutcome {
    pub fn is_premature(&self) -> bool {
        matches!(
            self,
            Self::Buffered
                | Self::Dropped(DropReason::NoConnection)
                | Self::Dropped(DropReason::RemoteDescriptionUnset)
        )
    }
}

/// Remote candidate intake. Never fails: every candidate ends up applied, held or dropped.
#[derive(Debug)]
pub struct CandidateInbox {
    policy: EarlyCandidatePolicy,
    pending: Vec<IceCandidate>,
}

impl CandidateInbox {
    pub fn new(policy: EarlyCandidatePolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn accept(
        &mut self,
        transport: Option<&dyn PeerTransport>,
        candidate: IceCandidate,
    ) -> CandidateOutcome {
        let Some(transport) = transport else {
            return self.hold_back(candidate, DropReason::NoConnection);
        };

        if transport.remote_description().await.is_none() {
            return self.hold_back(candidate, DropReason::RemoteDescriptionUnset);
        }

        apply(transport, candidate).await
    }

    /// Apply everything held back. Call after a remote description was set.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> Vec<CandidateOutcome> {
        let pending: Vec<_> = self.pending.drain(..).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying buffered remote candidates");
        }
        let mut outcomes = Vec::with_capacity(pending.len());
        for candidate in pending {
            outcomes.push(apply(transport, candidate).await);
        }
        outcomes
    }

    fn hold_back(&mut self, candidate: IceCandidate, reason: DropReason) -> CandidateOutcome {
        match self.policy {
            EarlyCandidatePolicy::Buffer if self.pending.len() < MAX_PENDING => {
                self.pending.push(candidate);
                CandidateOutcome::Buffered
            }
            _ => CandidateOutcome::Dropped(reason),
        }
    }
}

async fn apply(transport: &dyn PeerTransport, candidate: IceCandidate) -> CandidateOutcome {
    match transport.add_ice_candidate(candidate).await {
        Ok(()) => CandidateOutcome::Applied,
        Err(e) => CandidateOutcome::Dropped(DropReason::Rejected(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::simulated::SimulatedConnector;
    use crate::peer::types::SessionDescription;

    fn candidate() -> IceCandidate {
        IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host")
    }

    #[tokio::test]
    async fn early_candidate_is_dropped_by_default() {
        let connector = SimulatedConnector::new();
        let transport = connector.connect_simulated();
        let conn: &dyn PeerTransport = &*transport;
        let mut inbox = CandidateInbox::new(EarlyCandidatePolicy::Drop);

        let outcome = inbox.accept(Some(conn), candidate()).await;
        assert_eq!(outcome, CandidateOutcome::Dropped(DropReason::RemoteDescriptionUnset));
        assert!(outcome.is_premature());
        assert_eq!(inbox.pending(), 0);
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn candidate_without_connection_is_dropped() {
        let mut inbox = CandidateInbox::new(EarlyCandidatePolicy::Drop);
        let outcome = inbox.accept(None, candidate()).await;
        assert_eq!(outcome, CandidateOutcome::Dropped(DropReason::NoConnection));
    }

    #[tokio::test]
    async fn buffered_candidates_are_applied_on_flush() {
        let connector = SimulatedConnector::new();
        let transport = connector.connect_simulated();
        let conn: &dyn PeerTransport = &*transport;
        let mut inbox = CandidateInbox::new(EarlyCandidatePolicy::Buffer);

        assert_eq!(
            inbox.accept(Some(conn), candidate()).await,
            CandidateOutcome::Buffered
        );
        assert_eq!(inbox.pending(), 1);

        let offer = SessionDescription::offer(crate::peer::simulated::offer_sdp(1, &[]));
        transport.set_remote_description(offer).await.unwrap();

        let outcomes = inbox.flush(conn).await;
        assert_eq!(outcomes, vec![CandidateOutcome::Applied]);
        assert_eq!(inbox.pending(), 0);
        assert_eq!(transport.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn candidate_after_remote_description_is_applied() {
        let connector = SimulatedConnector::new();
        let transport = connector.connect_simulated();
        let conn: &dyn PeerTransport = &*transport;
        let mut inbox = CandidateInbox::new(EarlyCandidatePolicy::Drop);

        let offer = SessionDescription::offer(crate::peer::simulated::offer_sdp(1, &[]));
        transport.set_remote_description(offer).await.unwrap();

        let outcome = inbox.accept(Some(conn), candidate()).await;
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert!(!outcome.is_premature());
    }
}
