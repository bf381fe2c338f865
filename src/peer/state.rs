use chrono::{DateTime, Utc};
use std::fmt;

/// Negotiation progress of the single connection of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    ConnectionCreated,
    OfferSent,
    OfferReceived,
    /// Both descriptions applied; waiting for the transport to connect.
    AnswerExchanged,
    Stable,
}

impl NegotiationState {
    /// A new local offer may be generated from here. A round that is still
    /// waiting for connectivity finishes first.
    pub fn can_offer(self) -> bool {
        matches!(self, Self::ConnectionCreated | Self::Stable)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Transport connectivity as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Where a negotiation step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateConnection,
    AttachTracks,
    CreateOffer,
    CreateAnswer,
    ApplyOffer,
    ApplyAnswer,
    Rollback,
    Send,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateConnection => "create-connection",
            Self::AttachTracks => "attach-tracks",
            Self::CreateOffer => "create-offer",
            Self::CreateAnswer => "create-answer",
            Self::ApplyOffer => "apply-offer",
            Self::ApplyAnswer => "apply-answer",
            Self::Rollback => "rollback",
            Self::Send => "send",
        })
    }
}

/// Counters kept by the session; failures that are swallowed still show up here.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub created_at: DateTime<Utc>,
    pub stable_at: Option<DateTime<Utc>>,
    pub connections_created: u32,
    pub offers_sent: u32,
    pub answers_sent: u32,
    pub candidates_sent: u32,
    pub candidates_applied: u32,
    pub candidates_dropped: u32,
    /// Remote candidates that arrived before the remote description.
    pub premature_candidates: u32,
    pub negotiation_failures: u32,
    pub collisions_resolved: u32,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            stable_at: None,
            connections_created: 0,
            offers_sent: 0,
            answers_sent: 0,
            candidates_sent: 0,
            candidates_applied: 0,
            candidates_dropped: 0,
            premature_candidates: 0,
            negotiation_failures: 0,
            collisions_resolved: 0,
        }
    }
}
