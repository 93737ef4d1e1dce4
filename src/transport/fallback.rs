//! Fallback relay path
//!
//! When no direct channel is writable, application bytes travel to the peer
//! as `DATA_FALLBACK` frames through the rendezvous relay. The receiving side
//! hands them to the same message event as direct-channel data.
//! Delivery is whatever the relay gives: at most once, relay ordered.

use bytes::Bytes;
use tracing::trace;

use super::events::EventBus;
use crate::error::Result;
use crate::rendezvous::{PeerIdentifier, RendezvousClient, SignalMessage};

#[derive(Clone)]
pub struct FallbackRelay {
    rendezvous: RendezvousClient,
}

impl FallbackRelay {
    pub fn new(rendezvous: RendezvousClient) -> Self {
        Self { rendezvous }
    }

    /// Wrap `data` as a `DATA_FALLBACK` frame and queue it on the relay
    pub fn send_fallback(&self, peer: &PeerIdentifier, data: Bytes) -> Result<()> {
        let from = self.rendezvous.local_id().unwrap_or_default();
        trace!("Fallback {} bytes to {}", data.len(), peer.short());
        self.rendezvous.send(wrap(&from, peer, data))
    }
}

pub fn wrap(from: &PeerIdentifier, to: &PeerIdentifier, data: Bytes) -> SignalMessage {
    SignalMessage::fallback(from, to, data)
}

/// Sender and payload of a fallback frame addressed to `local`
pub fn unwrap(msg: &SignalMessage, local: &PeerIdentifier) -> Option<(PeerIdentifier, Bytes)> {
    match msg {
        SignalMessage::DataFallback { from, to, data } if to == local => {
            Some((from.clone(), data.clone()))
        }
        _ => None,
    }
}

/// Deliver an inbound fallback frame; returns whether it was one for us
pub fn deliver(msg: &SignalMessage, local: &PeerIdentifier, events: &EventBus) -> bool {
    match unwrap(msg, local) {
        Some((from, data)) => {
            trace!("Fallback {} bytes from {}", data.len(), from.short());
            events.message(&from, data);
            true
        }
        None => false,
    }
}
