//! Rendezvous signaling over a WebSocket relay
//!
//! Frames are JSON objects tagged by `type`:
//! - `welcome` assigns the session identifier, answered by `registerPublicKey`
//! - `OFFER`, `ANSWER`, `ICE_CANDIDATE` drive peer connection negotiation
//! - `DATA_FALLBACK` carries application bytes when no direct channel is open
//! - `join`, `leave`, `presence`, `relay` implement room fan-out

mod client;
pub mod server;
mod types;

#[cfg(test)]
mod tests;

pub use client::{Listener, RendezvousClient, Subscription};
pub use server::{start_relay_server, RelayHandle, RelayState, RelayStats};
pub use types::{
    generate_uuid, IceCandidate, LinkStatus, PeerIdentifier, RendezvousConfig, SdpType,
    SessionDescription, SignalMessage, DATA_CHANNEL_LABEL,
};
