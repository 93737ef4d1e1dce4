//! Typed application events
//!
//! One broadcast channel per event kind. Subscribers that fall more than
//! `capacity` events behind see `RecvError::Lagged`.

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use super::fidelity::FidelityLevel;
use crate::rendezvous::PeerIdentifier;

/// Connectivity change for a remote peer (`onPeerStatus`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: PeerIdentifier,
    pub connected: bool,
}

/// Application bytes from a remote peer (`onMessage`), whichever path carried them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer: PeerIdentifier,
    pub data: Bytes,
}

#[derive(Clone)]
pub struct EventBus {
    peer_status: broadcast::Sender<PeerStatus>,
    messages: broadcast::Sender<InboundMessage>,
    fidelity: broadcast::Sender<FidelityLevel>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            peer_status: broadcast::channel(capacity).0,
            messages: broadcast::channel(capacity).0,
            fidelity: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_peer_status(&self) -> broadcast::Receiver<PeerStatus> {
        self.peer_status.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_fidelity(&self) -> broadcast::Receiver<FidelityLevel> {
        self.fidelity.subscribe()
    }

    pub(crate) fn peer_status(&self, peer: &PeerIdentifier, connected: bool) {
        trace!("Peer {} status: connected={}", peer.short(), connected);
        let _ = self.peer_status.send(PeerStatus {
            peer: peer.clone(),
            connected,
        });
    }

    pub(crate) fn message(&self, peer: &PeerIdentifier, data: Bytes) {
        let _ = self.messages.send(InboundMessage {
            peer: peer.clone(),
            data,
        });
    }

    pub(crate) fn fidelity_changed(&self, level: FidelityLevel) {
        let _ = self.fidelity.send(level);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
