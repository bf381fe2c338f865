// Static configuration: relay endpoint, ICE servers, negotiation knobs, logging.
// Logging is on by default only in debug builds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub negotiation: NegotiationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate. A file without `[[ice_servers]]` gets the default STUN server.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        if config.ice_servers.is_empty() {
            config.ice_servers = default_ice_servers();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling.url.is_empty() {
            return Err(Error::Config("signaling url cannot be empty".into()));
        }
        if self.ice_servers.is_empty() {
            return Err(Error::Config("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config(format!("ICE server {} has an empty url", server.id)));
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn has_turn_server(&self) -> bool {
        self.ice_servers
            .iter()
            .any(|s| s.kind == IceServerKind::Turn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay endpoint; the room id is appended as a query parameter.
    pub url: String,
    pub room_param: String,
    pub room_path_prefix: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/join".into(),
            room_param: "roomID".into(),
            room_path_prefix: "/room/".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One reachability-assistance server handed to the peer connection at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        id: "default-stun".into(),
        kind: IceServerKind::Stun,
        url: "stun:stun.l.google.com:19302".into(),
        username: None,
        credential: None,
    }]
}

/// What to do with a remote candidate that arrives before the remote description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyCandidatePolicy {
    #[default]
    Drop,
    Buffer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub early_candidates: EarlyCandidatePolicy,
    /// Premature candidate count at which a warning is logged.
    pub premature_candidate_warn_threshold: u32,
    /// Resolve simultaneous offers by comparing offer origins.
    pub glare_resolution: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            early_candidates: EarlyCandidatePolicy::Drop,
            premature_candidate_warn_threshold: 5,
            glare_resolution: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            filter: "roomcall_lib=info,roomcall=info".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: default_ice_servers(),
            negotiation: NegotiationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
