pub mod connection;
pub mod ice;
#[cfg(any(test, feature = "test-util"))]
pub mod simulated;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcConnector, RtcTransport};
#[cfg(any(test, feature = "test-util"))]
pub use simulated::{SimulatedConnector, SimulatedTransport};
pub use state::{ConnectionState, NegotiationStage, NegotiationState, Role, SessionStats};
pub use transport::{Connector, PeerTransport, TransportEvent};
pub use types::{IceCandidate, SdpType, SessionDescription};
