//! Explicit wiring of the transport stack
//!
//! [`MeshNode::init`] builds the rendezvous client, the peer connection
//! manager and the fidelity controller around one event bus and starts
//! them; [`MeshNode::teardown`] stops them in reverse order.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::rendezvous::{PeerIdentifier, RendezvousClient, RendezvousConfig};
use crate::transport::{
    ConnectionFactory, EventBus, FidelityController, FidelityLevel, PeerConnectionManager, Route,
    TransportConfig, WebRtcFactory,
};

pub struct MeshNode {
    rendezvous: RendezvousClient,
    manager: PeerConnectionManager,
    fidelity: FidelityController,
    events: EventBus,
    fidelity_task: JoinHandle<()>,
}

impl MeshNode {
    /// Build and start the stack with the given connection factory
    pub fn init(
        rendezvous_config: RendezvousConfig,
        transport: TransportConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        info!("Starting mesh node against {}", rendezvous_config.url);
        let events = EventBus::new(transport.event_capacity);
        let rendezvous = RendezvousClient::new(rendezvous_config);
        let manager =
            PeerConnectionManager::new(rendezvous.clone(), factory, events.clone(), &transport);
        let fidelity = FidelityController::new(
            Arc::new(manager.clone()),
            events.clone(),
            transport.initial_fidelity,
        );
        let fidelity_task =
            fidelity.spawn(Duration::from_millis(transport.fidelity_interval_ms));

        rendezvous.connect();

        Self {
            rendezvous,
            manager,
            fidelity,
            events,
            fidelity_task,
        }
    }

    /// Build and start the stack over WebRTC peer connections
    pub fn with_webrtc(rendezvous_config: RendezvousConfig, transport: TransportConfig) -> Self {
        let factory = Arc::new(WebRtcFactory::new(transport.stun_servers.clone()));
        Self::init(rendezvous_config, transport, factory)
    }

    pub fn rendezvous(&self) -> &RendezvousClient {
        &self.rendezvous
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    pub fn fidelity(&self) -> &FidelityController {
        &self.fidelity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Session identifier once the relay has assigned one
    pub async fn session_id(&self, timeout: Duration) -> Option<PeerIdentifier> {
        self.rendezvous.wait_for_id(timeout).await
    }

    pub async fn connect_to(&self, peer: &PeerIdentifier) -> Result<()> {
        self.manager.connect_to(peer).await
    }

    pub async fn send(&self, peer: &PeerIdentifier, data: Bytes) -> Result<Route> {
        self.manager.send(peer, data).await
    }

    pub async fn set_fidelity(&self, level: FidelityLevel) -> FidelityLevel {
        self.fidelity.set_fidelity(level).await
    }

    /// Stop the fidelity controller, then the manager, then the relay socket
    pub async fn teardown(self) {
        self.fidelity.shutdown();
        if let Err(e) = self.fidelity_task.await {
            debug!("Fidelity task ended abnormally: {}", e);
        }
        self.manager.shutdown();
        self.rendezvous.shutdown();
        info!("Mesh node stopped");
    }
}
