use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// Relay envelope: a JSON object with exactly one key.
///
/// ```json
/// {"join": true}
/// {"offer": {"type": "offer", "sdp": "v=0..."}}
/// {"answer": {"type": "answer", "sdp": "v=0..."}}
/// {"iceCandidate": {"candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMessage {
    #[serde(rename = "join")]
    Join(bool),
    #[serde(rename = "offer")]
    Offer(SessionDescription),
    #[serde(rename = "answer")]
    Answer(SessionDescription),
    #[serde(rename = "iceCandidate")]
    IceCandidate(IceCandidate),
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "iceCandidate",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SdpType;

    #[test]
    fn join_is_a_single_key_object() {
        assert_eq!(SignalMessage::Join(true).to_json().unwrap(), r#"{"join":true}"#);
        assert_eq!(
            SignalMessage::from_json(r#"{"join":true}"#).unwrap(),
            SignalMessage::Join(true)
        );
    }

    #[test]
    fn parses_browser_messages() {
        let offer = SignalMessage::from_json(r#"{"offer":{"type":"offer","sdp":"v=0\r\n"}}"#)
            .unwrap();
        match offer {
            SignalMessage::Offer(desc) => assert_eq!(desc.sdp_type, SdpType::Offer),
            other => panic!("unexpected {other:?}"),
        }

        let candidate = SignalMessage::from_json(
            r#"{"iceCandidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        assert_eq!(candidate.kind(), "iceCandidate");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SignalMessage::from_json(r#"{"leave":true}"#).is_err());
        assert!(SignalMessage::from_json(r#"{}"#).is_err());
    }
}
