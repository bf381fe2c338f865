use crate::media::Device;

/// Errors produced by the call session and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("failed to acquire {device}: {reason}")]
    Acquisition { device: Device, reason: String },

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("signaling: {0}")]
    Signaling(String),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("no peer connection")]
    NoConnection,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("invalid room path: {0}")]
    InvalidRoomPath(String),

    #[error("session is not running")]
    SessionStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
