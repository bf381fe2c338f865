//! In-process relay with the same forwarding rules as the room server:
//! every message goes to the other members of the same room, never back to
//! the sender, and a room holds at most two members.

use super::{SignalMessage, SignalingChannel, CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

const ROOM_CAPACITY: usize = 2;

struct Member {
    id: u64,
    tx: mpsc::Sender<SignalMessage>,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    rooms: Arc<RwLock<HashMap<String, Vec<Member>>>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room_id`. The member leaves when the returned channel's outbound side is dropped.
    pub async fn join(&self, room_id: &str) -> Result<SignalingChannel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

        {
            let mut rooms = self.rooms.write().await;
            let members = rooms.entry(room_id.to_string()).or_default();
            if members.len() >= ROOM_CAPACITY {
                return Err(Error::RoomFull(room_id.to_string()));
            }
            members.push(Member { id, tx: in_tx });
            info!(room = %room_id, member = id, count = members.len(), "member joined");
        }

        tokio::spawn(self.clone().forward(room_id.to_string(), id, out_rx));
        Ok(SignalingChannel::new(out_tx, in_rx))
    }

    pub async fn members(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, |members| members.len())
    }

    async fn forward(self, room_id: String, id: u64, mut out_rx: mpsc::Receiver<SignalMessage>) {
        while let Some(msg) = out_rx.recv().await {
            let peers: Vec<mpsc::Sender<SignalMessage>> = {
                let rooms = self.rooms.read().await;
                rooms
                    .get(&room_id)
                    .map(|members| {
                        members
                            .iter()
                            .filter(|m| m.id != id)
                            .map(|m| m.tx.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            debug!(room = %room_id, from = id, kind = msg.kind(), peers = peers.len(), "relaying");
            for peer in peers {
                if peer.send(msg.clone()).await.is_err() {
                    debug!(room = %room_id, "peer channel closed");
                }
            }
        }
        self.leave(&room_id, id).await;
    }

    async fn leave(&self, room_id: &str, id: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.retain(|m| m.id != id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
        info!(room = %room_id, member = id, "member left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_reach_only_the_other_member() {
        let relay = LoopbackRelay::new();
        let mut a = relay.join("abc123").await.unwrap();
        let mut b = relay.join("abc123").await.unwrap();
        let mut other_room = relay.join("elsewhere").await.unwrap();

        a.outbound.send(SignalMessage::Join(true)).await.unwrap();
        assert_eq!(b.inbound.recv().await, Some(SignalMessage::Join(true)));
        assert!(a.inbound.try_recv().is_err());
        assert!(other_room.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn third_member_is_refused() {
        let relay = LoopbackRelay::new();
        let _a = relay.join("r").await.unwrap();
        let _b = relay.join("r").await.unwrap();
        assert!(matches!(relay.join("r").await, Err(Error::RoomFull(room)) if room == "r"));
        assert_eq!(relay.members("r").await, 2);
    }
}
