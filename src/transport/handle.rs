//! Negotiated connection handles
//!
//! The peer connection manager drives negotiation through these traits and
//! never touches a platform connection directly. Platform callbacks (local
//! candidates, channel readiness, inbound data, closure) come back through an
//! [`EventSink`] tagged with the handle's generation, so events from a handle
//! that has since been replaced are recognised and ignored.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::rendezvous::{IceCandidate, PeerIdentifier, SessionDescription};

/// Application data channel attached to a negotiated connection
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    /// Whether the channel is currently writable
    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Asynchronous callbacks from a negotiated connection
pub enum ConnectionEvent {
    /// A local ICE candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    /// The data channel is open and writable
    ChannelOpen(Arc<dyn DataChannel>),
    /// Bytes received on the data channel
    Message(Bytes),
    /// The data channel or the underlying connection closed or failed
    ChannelClosed,
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            ConnectionEvent::ChannelOpen(_) => write!(f, "ChannelOpen"),
            ConnectionEvent::Message(data) => write!(f, "Message({} bytes)", data.len()),
            ConnectionEvent::ChannelClosed => write!(f, "ChannelClosed"),
        }
    }
}

/// Event as delivered to the manager
#[derive(Debug)]
pub struct SinkEvent {
    pub peer: PeerIdentifier,
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Where a connection handle reports its platform callbacks
#[derive(Clone)]
pub struct EventSink {
    peer: PeerIdentifier,
    generation: u64,
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl EventSink {
    pub fn new(peer: PeerIdentifier, generation: u64, tx: mpsc::UnboundedSender<SinkEvent>) -> Self {
        Self { peer, generation, tx }
    }

    pub fn peer(&self) -> &PeerIdentifier {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; a no-op once the manager has gone away
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(SinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// A platform connection in negotiation or established.
///
/// Every step is a suspension point; an error from any of them ends the
/// negotiation for this handle.
#[async_trait]
pub trait NegotiatedConnection: Send + Sync + 'static {
    /// Attach an outbound data channel (offering side, before `create_offer`).
    /// The channel is reported through [`ConnectionEvent::ChannelOpen`].
    async fn open_data_channel(&self, label: &str) -> Result<()>;

    /// Create and apply the local offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer, then create and apply the local answer
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer (offering side)
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear the connection down, aborting any negotiation in progress
    async fn close(&self) -> Result<()>;
}

/// Creates negotiated connection handles
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn NegotiatedConnection>>;
}
