//! Peer transport
//!
//! The [`PeerConnectionManager`] negotiates one direct data channel per
//! remote session over the rendezvous relay and falls back to relaying
//! application bytes through it when no channel is writable. The
//! [`FidelityController`] watches the manager's channels and downgrades the
//! shared quality level when any of them stops being writable.

mod events;
pub mod fallback;
mod fidelity;
mod handle;
mod manager;
pub mod memory;
pub mod webrtc;

pub use events::{EventBus, InboundMessage, PeerStatus};
pub use fallback::FallbackRelay;
pub use fidelity::{ChannelHealth, FidelityController, FidelityLevel, HealthSource};
pub use handle::{
    ConnectionEvent, ConnectionFactory, DataChannel, EventSink, NegotiatedConnection, SinkEvent,
};
pub use manager::{PeerConnectionManager, PeerDirection, PeerPhase, PeerSnapshot, Route};
pub use memory::{MemoryFactory, MemoryNetwork};
pub use webrtc::WebRtcFactory;

/// Default public STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Give up on a negotiation that has not opened a channel after this long
    pub negotiation_timeout_ms: u64,
    /// Fidelity evaluation interval
    pub fidelity_interval_ms: u64,
    /// Level before any downgrade or request
    pub initial_fidelity: FidelityLevel,
    pub stun_servers: Vec<String>,
    /// Per-kind buffer of the event bus
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 15_000,
            fidelity_interval_ms: 4_000,
            initial_fidelity: FidelityLevel::High,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            event_capacity: 256,
        }
    }
}
