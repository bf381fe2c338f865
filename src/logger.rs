use crate::config::LoggingConfig;
use crate::peer::types::{CandidateKind, IceCandidate};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the configured filter.
/// Calling it again (or after another subscriber was set) is a no-op.
pub fn init(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Trickle candidate trace, one line per candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        kind = %cand.kind(),
        address = cand.address().unwrap_or("?"),
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate: {}",
        cand.candidate
    );
}

/// Candidate counts per kind for one gathering round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateSummary {
    pub counts: HashMap<CandidateKind, usize>,
}

impl CandidateSummary {
    pub fn count(&self, kind: CandidateKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Log what was gathered. Without a relay candidate a configured TURN server is
/// probably unreachable or rejecting the credential.
pub fn analyze_candidates(candidates: &[IceCandidate], turn_configured: bool) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for cand in candidates {
        *summary.counts.entry(cand.kind()).or_default() += 1;
    }

    info!(
        total = summary.total(),
        host = summary.count(CandidateKind::Host),
        srflx = summary.count(CandidateKind::ServerReflexive),
        relay = summary.count(CandidateKind::Relay),
        "candidate gathering complete"
    );
    if turn_configured && summary.count(CandidateKind::Relay) == 0 {
        warn!("TURN server configured but no relay candidate was gathered");
    }
    summary
}

/// getStats snapshot of the nominated pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_kinds() {
        let candidates = vec![
            IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.4 5000 typ host"),
            IceCandidate::new("candidate:2 1 udp 2130706431 10.0.0.4 5001 typ host"),
            IceCandidate::new(
                "candidate:3 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 0.0.0.0 rport 0",
            ),
        ];
        let summary = analyze_candidates(&candidates, true);
        assert_eq!(summary.count(CandidateKind::Host), 2);
        assert_eq!(summary.count(CandidateKind::ServerReflexive), 1);
        assert_eq!(summary.count(CandidateKind::Relay), 0);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LoggingConfig {
            enabled: true,
            filter: "roomcall_lib=debug".into(),
        };
        init(&config);
        init(&config);
    }
}
