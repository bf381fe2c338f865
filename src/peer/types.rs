use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as it travels over the relay: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Session id from the `o=` line.
    pub fn origin_session_id(&self) -> Option<u64> {
        self.sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix("o="))
            .and_then(|origin| origin.split_whitespace().nth(1))
            .and_then(|id| id.parse().ok())
    }

    /// Media word of every `m=` section whose direction sends media
    /// (`sendrecv`, `sendonly`, or no direction attribute), in order.
    pub fn sending_media_kinds(&self) -> Vec<&str> {
        let mut kinds = Vec::new();
        let mut section: Option<(&str, bool)> = None;
        for line in self.sdp.lines().map(str::trim) {
            if let Some(media) = line.strip_prefix("m=") {
                if let Some((kind, true)) = section {
                    kinds.push(kind);
                }
                section = media.split_whitespace().next().map(|kind| (kind, true));
            } else if let Some((_, sends)) = section.as_mut() {
                match line {
                    "a=recvonly" | "a=inactive" => *sends = false,
                    "a=sendrecv" | "a=sendonly" => *sends = true,
                    _ => {}
                }
            }
        }
        if let Some((kind, true)) = section {
            kinds.push(kind);
        }
        kinds
    }

    /// Orders two competing offers. Both peers evaluate this on the same pair,
    /// so exactly one of them sees `Greater` for its own offer. `Equal` only
    /// for byte-identical offers.
    pub fn collision_priority(&self, other: &SessionDescription) -> Ordering {
        match (self.origin_session_id(), other.origin_session_id()) {
            (Some(a), Some(b)) if a != b => a.cmp(&b),
            _ => self.sdp.cmp(&other.sdp),
        }
    }
}

/// Trickle candidate in the browser's `RTCIceCandidate.toJSON()` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn kind(&self) -> CandidateKind {
        let mut fields = self.candidate.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "typ" {
                return fields.next().map(CandidateKind::from_typ).unwrap_or_default();
            }
        }
        CandidateKind::Unknown
    }

    /// Connection address, the fifth field of the candidate attribute.
    pub fn address(&self) -> Option<&str> {
        self.candidate.split_whitespace().nth(4)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    #[default]
    Unknown,
}

impl CandidateKind {
    fn from_typ(typ: &str) -> Self {
        match typ {
            "host" => Self::Host,
            "srflx" => Self::ServerReflexive,
            "prflx" => Self::PeerReflexive,
            "relay" => Self::Relay,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
            Self::Unknown => "unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_kind_and_address() {
        let srflx = IceCandidate::new(
            "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 10.0.0.2 rport 46154",
        );
        assert_eq!(srflx.kind(), CandidateKind::ServerReflexive);
        assert_eq!(srflx.address(), Some("203.0.113.7"));

        let relay = IceCandidate::new("candidate:1 1 udp 41885439 198.51.100.1 3478 typ relay");
        assert_eq!(relay.kind(), CandidateKind::Relay);

        let host = IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.4 5000 typ host");
        assert_eq!(host.kind(), CandidateKind::Host);

        assert_eq!(IceCandidate::new("").kind(), CandidateKind::Unknown);
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));

        let value = serde_json::to_value(&candidate).unwrap();
        assert!(value.get("sdpMLineIndex").is_some());
        assert!(value.get("sdp_mline_index").is_none());
    }

    #[test]
    fn description_round_trips_browser_shape() {
        let desc: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(desc.sdp_type, SdpType::Answer);
        assert_eq!(
            serde_json::to_string(&SessionDescription::offer("x")).unwrap(),
            r#"{"type":"offer","sdp":"x"}"#
        );
    }

    #[test]
    fn collision_priority_is_antisymmetric() {
        let a = SessionDescription::offer("v=0\r\no=- 42 2 IN IP4 127.0.0.1\r\ns=-\r\n");
        let b = SessionDescription::offer("v=0\r\no=- 7 2 IN IP4 127.0.0.1\r\ns=-\r\n");
        assert_eq!(a.origin_session_id(), Some(42));
        assert_eq!(a.collision_priority(&b), Ordering::Greater);
        assert_eq!(b.collision_priority(&a), Ordering::Less);

        let c = SessionDescription::offer("no origin here");
        let d = SessionDescription::offer("no origin there");
        assert_eq!(c.collision_priority(&d), d.collision_priority(&c).reverse());
    }

    #[test]
    fn receive_only_sections_are_not_sending() {
        let desc = SessionDescription::answer(
            "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=sendrecv\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=recvonly\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:2\r\n",
        );
        assert_eq!(desc.sending_media_kinds(), vec!["audio", "video"]);
        assert!(SessionDescription::answer("v=0\r\n").sending_media_kinds().is_empty());
    }
}
