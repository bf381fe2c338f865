use crate::config::{IceServerConfig, IceServerKind};
use crate::error::{Error, Result};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefix the ICE server URL with `stun:`/`turn:` when the configured value has no scheme.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    const SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];
    if SCHEMES.iter().any(|s| config.url.starts_with(s)) {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Extract the room id from a navigation path such as `/room/abc123`.
///
/// Accepts full URLs as well; query string and fragment are ignored.
pub fn room_id_from_path(path: &str, prefix: &str) -> Result<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let path = match path.find("://") {
        Some(idx) => {
            let rest = &path[idx + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => path,
    };

    let prefix = prefix.trim_end_matches('/');
    let after = path
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| Error::InvalidRoomPath(path.to_string()))?;

    let id = after.split('/').next().unwrap_or_default();
    if id.is_empty() {
        return Err(Error::InvalidRoomPath(path.to_string()));
    }
    Ok(id.to_string())
}

/// Relay endpoint for a room: `base?param=room_id`.
pub fn signaling_url(base: &str, param: &str, room_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{param}={room_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: IceServerKind, url: &str) -> IceServerConfig {
        IceServerConfig {
            id: "s".into(),
            kind,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_is_added_only_when_missing() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun.l.google.com:19302")),
            "stun:stun.l.google.com:19302"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "relay.example.org:3478")),
            "turn:relay.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "turns:relay.example.org:5349")),
            "turns:relay.example.org:5349"
        );
    }

    #[test]
    fn room_id_is_taken_from_the_segment_after_the_prefix() {
        assert_eq!(room_id_from_path("/room/abc123", "/room/").unwrap(), "abc123");
        assert_eq!(room_id_from_path("/room/abc123/", "/room").unwrap(), "abc123");
        assert_eq!(
            room_id_from_path("https://meet.example.org/room/xyz?ref=mail#top", "/room/").unwrap(),
            "xyz"
        );
    }

    #[test]
    fn room_path_without_id_is_rejected() {
        assert!(room_id_from_path("/room/", "/room/").is_err());
        assert!(room_id_from_path("/lobby/abc", "/room/").is_err());
        assert!(room_id_from_path("/roomabc", "/room/").is_err());
    }

    #[test]
    fn signaling_url_appends_room_parameter() {
        assert_eq!(
            signaling_url("ws://localhost:8000/join", "roomID", "abc"),
            "ws://localhost:8000/join?roomID=abc"
        );
        assert_eq!(
            signaling_url("ws://h/join?v=2", "roomID", "abc"),
            "ws://h/join?v=2&roomID=abc"
        );
    }

    #[test]
    fn random_ids_are_16_hex_chars() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
