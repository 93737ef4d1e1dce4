//! Error types for the transport layer

use thiserror::Error;

use crate::rendezvous::PeerIdentifier;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Rendezvous client has shut down")]
    RendezvousClosed,

    #[error("Peer connection manager has shut down")]
    ManagerClosed,

    #[error("Cannot connect to own session identifier {0}")]
    SelfConnect(PeerIdentifier),

    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PeerIdentifier, reason: String },
}

impl TransportError {
    pub fn negotiation(peer: &PeerIdentifier, err: impl std::fmt::Display) -> Self {
        TransportError::Negotiation {
            peer: peer.clone(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
