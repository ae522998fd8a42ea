//! In-process relay
//!
//! Every packet one participant sends is delivered to every other joined
//! participant, the way a voice server relays to its clients.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::NetworkError;
use crate::network::{Transport, VoicePacket};

/// Packets buffered per participant before the relay starts dropping
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Relay shared by every participant in a room
#[derive(Clone)]
pub struct ChannelHub {
    peers: Arc<Mutex<HashMap<Uuid, Sender<VoicePacket>>>>,
    capacity: usize,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Join as `participant`. Rejoining replaces the previous endpoint.
    pub fn join(&self, participant: Uuid) -> HubEndpoint {
        let (tx, rx) = bounded(self.capacity);
        self.peers.lock().insert(participant, tx);
        debug!(%participant, "Joined hub");
        HubEndpoint {
            participant,
            hub: self.clone(),
            rx,
        }
    }

    pub fn participants(&self) -> Vec<Uuid> {
        self.peers.lock().keys().copied().collect()
    }

    fn leave(&self, participant: Uuid) {
        if self.peers.lock().remove(&participant).is_some() {
            debug!(%participant, "Left hub");
        }
    }

    fn relay(&self, from: Uuid, packet: &VoicePacket) {
        let peers = self.peers.lock();
        for (id, tx) in peers.iter().filter(|(id, _)| **id != from) {
            match tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(participant = %id, "Relay queue full, dropping packet"),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// One participant's connection to a [`ChannelHub`]. Leaves on drop.
pub struct HubEndpoint {
    participant: Uuid,
    hub: ChannelHub,
    rx: Receiver<VoicePacket>,
}

impl HubEndpoint {
    pub fn participant(&self) -> Uuid {
        self.participant
    }
}

impl Transport for HubEndpoint {
    fn send(&mut self, packet: &VoicePacket) -> Result<(), NetworkError> {
        self.hub.relay(self.participant, packet);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<VoicePacket>, NetworkError> {
        match self.rx.try_recv() {
            Ok(packet) => Ok(Some(packet)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(NetworkError::Disconnected),
        }
    }
}

impl Drop for HubEndpoint {
    fn drop(&mut self) {
        self.hub.leave(self.participant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_skips_sender() {
        let hub = ChannelHub::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut alice = hub.join(a);
        let mut bob = hub.join(b);
        let mut carol = hub.join(c);

        let packet = VoicePacket::new(a, 1, vec![1, 0, 42]);
        alice.send(&packet).unwrap();

        assert!(alice.try_recv().unwrap().is_none());
        assert_eq!(bob.try_recv().unwrap(), Some(packet.clone()));
        assert_eq!(carol.try_recv().unwrap(), Some(packet));
    }

    #[test]
    fn test_leave_on_drop() {
        let hub = ChannelHub::new();
        let a = Uuid::new_v4();
        let alice = hub.join(a);
        let _bob = hub.join(Uuid::new_v4());
        assert_eq!(hub.participants().len(), 2);

        drop(alice);
        assert!(!hub.participants().contains(&a));
    }

    #[test]
    fn test_full_queue_drops() {
        let hub = ChannelHub::with_capacity(1);
        let a = Uuid::new_v4();
        let mut alice = hub.join(a);
        let mut bob = hub.join(Uuid::new_v4());

        alice.send(&VoicePacket::new(a, 1, vec![])).unwrap();
        alice.send(&VoicePacket::new(a, 2, vec![])).unwrap();

        assert_eq!(bob.try_recv().unwrap().map(|p| p.sequence), Some(1));
        assert!(bob.try_recv().unwrap().is_none());
    }
}
