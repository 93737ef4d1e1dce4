pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod node;
pub mod rendezvous;
pub mod transport;

pub use config::Config;
pub use directory::{ContactEntry, PeerDirectory, Relation};
pub use error::TransportError;
pub use identity::LocalIdentity;
pub use node::MeshNode;
pub use rendezvous::{
    start_relay_server, PeerIdentifier, RelayHandle, RendezvousClient, RendezvousConfig,
    SignalMessage,
};
pub use transport::{
    EventBus, FidelityController, FidelityLevel, MemoryNetwork, PeerConnectionManager, Route,
    TransportConfig, WebRtcFactory,
};
