//! Room-scoped message transport to the other participant.

pub mod loopback;
pub mod message;
pub mod websocket;

pub use loopback::LoopbackRelay;
pub use message::SignalMessage;

use tokio::sync::mpsc;

/// Capacity of each direction of a channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// Both directions of an open signaling connection. The inbound side yields
/// `None` once the relay closed the connection; dropping the outbound side
/// closes it from our end.
#[derive(Debug)]
pub struct SignalingChannel {
    pub outbound: mpsc::Sender<SignalMessage>,
    pub inbound: mpsc::Receiver<SignalMessage>,
}

impl SignalingChannel {
    pub fn new(
        outbound: mpsc::Sender<SignalMessage>,
        inbound: mpsc::Receiver<SignalMessage>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn split(self) -> (mpsc::Sender<SignalMessage>, mpsc::Receiver<SignalMessage>) {
        (self.outbound, self.inbound)
    }
}
