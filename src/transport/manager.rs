//! Peer connection manager
//!
//! Owns one connection state per remote session identifier and drives it
//! `Idle -> Negotiating -> Open -> Closed`. All negotiation runs on a single
//! actor task fed by three queues: commands from the handle, peer-addressed
//! rendezvous frames, and platform callbacks from connection handles.
//!
//! `send` does not go through the actor. It looks at the current state and
//! writes to the open channel directly, or hands the bytes to the fallback
//! relay when there is no writable channel. The choice is made per call.
//!
//! Ordering: bytes on one path arrive in order. Bytes that switch paths
//! mid-stream (a channel closing between two sends) may be reordered
//! relative to each other; nothing here resequences them.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::events::EventBus;
use super::fallback::{self, FallbackRelay};
use super::fidelity::{ChannelHealth, HealthSource};
use super::handle::{
    ConnectionEvent, ConnectionFactory, DataChannel, EventSink, NegotiatedConnection, SinkEvent,
};
use super::TransportConfig;
use crate::error::{Result, TransportError};
use crate::rendezvous::{
    IceCandidate, PeerIdentifier, RendezvousClient, SessionDescription, SignalMessage,
    Subscription, DATA_CHANNEL_LABEL,
};

/// Lifecycle phase of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Idle,
    Negotiating,
    Open,
    Closed,
}

impl PeerPhase {
    fn is_live(self) -> bool {
        matches!(self, PeerPhase::Negotiating | PeerPhase::Open)
    }
}

impl std::fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerPhase::Idle => write!(f, "idle"),
            PeerPhase::Negotiating => write!(f, "negotiating"),
            PeerPhase::Open => write!(f, "open"),
            PeerPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Which side sent the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for PeerDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerDirection::Inbound => write!(f, "inbound"),
            PeerDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Path that carried a `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer: PeerIdentifier,
    pub phase: PeerPhase,
    pub direction: PeerDirection,
    pub last_activity: Instant,
}

struct PeerEntry {
    phase: PeerPhase,
    direction: PeerDirection,
    generation: u64,
    connection: Arc<dyn NegotiatedConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    /// Remote offer or answer applied; candidates before that are buffered
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    last_activity: Instant,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct ManagerState {
    peers: RwLock<HashMap<PeerIdentifier, PeerEntry>>,
}

enum Command {
    Connect {
        peer: PeerIdentifier,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: PeerIdentifier,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
pub struct PeerConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<ManagerState>,
    fallback: FallbackRelay,
    events: EventBus,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PeerConnectionManager {
    /// Create the manager and spawn its actor. Frames addressed to the local
    /// session start arriving as soon as the rendezvous client is connected.
    pub fn new(
        rendezvous: RendezvousClient,
        factory: Arc<dyn ConnectionFactory>,
        events: EventBus,
        config: &TransportConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ManagerState::default());

        // Room frames and unknown types have no recipient
        let subscription = rendezvous.on(move |msg| {
            if msg.recipient().is_some() {
                let _ = signal_tx.send(msg.clone());
            }
        });

        let actor = Actor {
            state: state.clone(),
            rendezvous: rendezvous.clone(),
            factory,
            events: events.clone(),
            sink_tx,
            next_generation: 0,
            negotiation_timeout: Duration::from_millis(config.negotiation_timeout_ms),
        };
        tokio::spawn(actor.run(command_rx, signal_rx, sink_rx, shutdown_rx, subscription));

        Self {
            commands,
            state,
            fallback: FallbackRelay::new(rendezvous),
            events,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Start negotiating with `peer` as the offering side.
    ///
    /// Returns once the offer is queued on the relay. A peer that is already
    /// negotiating or open is left alone, unless the only state is an inbound
    /// handle still waiting for the remote offer.
    pub async fn connect_to(&self, peer: &PeerIdentifier) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                peer: peer.clone(),
                reply,
            })
            .map_err(|_| TransportError::ManagerClosed)?;
        rx.await.map_err(|_| TransportError::ManagerClosed)?
    }

    /// Send application bytes to `peer` over its open channel, or through
    /// the relay when there is none.
    pub async fn send(&self, peer: &PeerIdentifier, data: Bytes) -> Result<Route> {
        if *self.shutdown.borrow() {
            return Err(TransportError::ManagerClosed);
        }

        if let Some(channel) = self.writable_channel(peer).await {
            match channel.send(data.clone()).await {
                Ok(()) => {
                    trace!("Sent {} bytes to {} directly", data.len(), peer.short());
                    return Ok(Route::Direct);
                }
                Err(e) => debug!("Direct send to {} failed, using fallback: {}", peer.short(), e),
            }
        }

        self.fallback.send_fallback(peer, data)?;
        Ok(Route::Fallback)
    }

    async fn writable_channel(&self, peer: &PeerIdentifier) -> Option<Arc<dyn DataChannel>> {
        let peers = self.state.peers.read().await;
        let entry = peers.get(peer)?;
        if entry.phase != PeerPhase::Open {
            return None;
        }
        entry.channel.clone().filter(|c| c.is_open())
    }

    /// Close and forget `peer`. Returns whether there was a state to drop.
    pub async fn disconnect(&self, peer: &PeerIdentifier) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect {
                peer: peer.clone(),
                reply,
            })
            .map_err(|_| TransportError::ManagerClosed)?;
        rx.await.map_err(|_| TransportError::ManagerClosed)
    }

    pub async fn phase(&self, peer: &PeerIdentifier) -> PeerPhase {
        self.state
            .peers
            .read()
            .await
            .get(peer)
            .map(|e| e.phase)
            .unwrap_or(PeerPhase::Idle)
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .state
            .peers
            .read()
            .await
            .iter()
            .map(|(peer, e)| PeerSnapshot {
                peer: peer.clone(),
                phase: e.phase,
                direction: e.direction,
                last_activity: e.last_activity,
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop the actor and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl HealthSource for PeerConnectionManager {
    async fn channel_health(&self) -> ChannelHealth {
        let peers = self.state.peers.read().await;
        let mut health = ChannelHealth::default();
        for entry in peers.values() {
            let Some(channel) = &entry.channel else {
                continue;
            };
            health.tracked += 1;
            if entry.phase != PeerPhase::Open || !channel.is_open() {
                health.unhealthy += 1;
            }
        }
        health
    }
}

struct Actor {
    state: Arc<ManagerState>,
    rendezvous: RendezvousClient,
    factory: Arc<dyn ConnectionFactory>,
    events: EventBus,
    sink_tx: mpsc::UnboundedSender<SinkEvent>,
    next_generation: u64,
    negotiation_timeout: Duration,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SignalMessage>,
        mut sink_events: mpsc::UnboundedReceiver<SinkEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
        subscription: Subscription,
    ) {
        debug!("Peer connection manager started");

        loop {
            let deadline = self.next_deadline().await;
            let timing = deadline.is_some();
            let deadline = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Connect { peer, reply }) => {
                            let result = self.connect(peer).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Disconnect { peer, reply }) => {
                            let removed = self.disconnect(&peer).await;
                            let _ = reply.send(removed);
                        }
                        None => break,
                    }
                }
                Some(msg) = signals.recv() => {
                    self.on_signal(msg).await;
                }
                Some(event) = sink_events.recv() => {
                    self.on_sink_event(event).await;
                }
                _ = tokio::time::sleep_until(deadline), if timing => {
                    self.expire_negotiations().await;
                }
            }
        }

        subscription.unsubscribe();
        let entries: Vec<(PeerIdentifier, PeerEntry)> =
            self.state.peers.write().await.drain().collect();
        for (peer, entry) in entries {
            retire(&peer, entry).await;
        }
        info!("Peer connection manager stopped");
    }

    async fn next_deadline(&self) -> Option<Instant> {
        self.state
            .peers
            .read()
            .await
            .values()
            .filter_map(|e| e.deadline)
            .min()
    }

    fn local_id(&self) -> PeerIdentifier {
        self.rendezvous.local_id().unwrap_or_default()
    }

    /// Create a fresh handle for `peer` and replace whatever state it had
    async fn install(
        &mut self,
        peer: &PeerIdentifier,
        direction: PeerDirection,
    ) -> Result<Arc<dyn NegotiatedConnection>> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = EventSink::new(peer.clone(), generation, self.sink_tx.clone());
        let connection = self
            .factory
            .create(sink)
            .await
            .map_err(|e| TransportError::negotiation(peer, e))?;

        let now = Instant::now();
        let entry = PeerEntry {
            phase: PeerPhase::Negotiating,
            direction,
            generation,
            connection: connection.clone(),
            channel: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            last_activity: now,
            deadline: Some(now + self.negotiation_timeout),
        };
        let previous = self.state.peers.write().await.insert(peer.clone(), entry);
        if let Some(previous) = previous {
            retire(peer, previous).await;
        }
        debug!(
            "Peer {} negotiating ({}, generation {})",
            peer.short(),
            direction,
            generation
        );
        Ok(connection)
    }

    async fn connect(&mut self, peer: PeerIdentifier) -> Result<()> {
        let local = self.local_id();
        if peer == local {
            return Err(TransportError::SelfConnect(peer));
        }
        if peer.is_empty() {
            return Err(TransportError::negotiation(&peer, "empty peer identifier"));
        }

        let existing = self
            .state
            .peers
            .read()
            .await
            .get(&peer)
            .map(|e| (e.phase, e.direction, e.remote_applied));
        let mut carried = Vec::new();
        match existing {
            // Handle created by a stray candidate; no offer has arrived for it
            Some((PeerPhase::Negotiating, PeerDirection::Inbound, false)) => {
                debug!("Replacing unanswered inbound handle for {} with our offer", peer.short());
                if let Some(entry) = self.state.peers.write().await.get_mut(&peer) {
                    carried = std::mem::take(&mut entry.pending_candidates);
                }
            }
            Some((phase, ..)) if phase.is_live() => {
                debug!("Already connecting to {}", peer.short());
                return Ok(());
            }
            _ => {}
        }

        info!("Connecting to peer {}", peer.short());
        let connection = self.install(&peer, PeerDirection::Outbound).await?;
        if !carried.is_empty() {
            if let Some(entry) = self.state.peers.write().await.get_mut(&peer) {
                entry.pending_candidates = carried;
            }
        }
        let offer = async {
            connection.open_data_channel(DATA_CHANNEL_LABEL).await?;
            connection.create_offer().await
        }
        .await;

        match offer {
            Ok(offer) => self.rendezvous.send(SignalMessage::offer(&local, &peer, offer)),
            Err(e) => {
                self.close_peer(&peer, None, "offer failed").await;
                Err(TransportError::negotiation(&peer, e))
            }
        }
    }

    async fn disconnect(&mut self, peer: &PeerIdentifier) -> bool {
        let Some(entry) = self.state.peers.write().await.remove(peer) else {
            return false;
        };
        info!("Disconnecting peer {}", peer.short());
        if entry.phase.is_live() {
            self.events.peer_status(peer, false);
        }
        retire(peer, entry).await;
        true
    }

    async fn on_signal(&mut self, msg: SignalMessage) {
        let Some(local) = self.rendezvous.local_id() else {
            trace!("Dropping {} before session id is known", msg.msg_type());
            return;
        };
        if msg.recipient() != Some(&local) {
            trace!("Ignoring {} addressed to another session", msg.msg_type());
            return;
        }
        if msg.sender().map_or(true, |s| s.is_empty() || *s == local) {
            debug!("Ignoring {} without a usable sender", msg.msg_type());
            return;
        }

        match msg {
            SignalMessage::Offer { from, data, .. } => self.on_offer(&local, from, data).await,
            SignalMessage::Answer { from, data, .. } => self.on_answer(from, data).await,
            SignalMessage::IceCandidate { from, data, .. } => self.on_candidate(from, data).await,
            msg @ SignalMessage::DataFallback { .. } => {
                fallback::deliver(&msg, &local, &self.events);
            }
            _ => {}
        }
    }

    async fn on_offer(&mut self, local: &PeerIdentifier, from: PeerIdentifier, offer: SessionDescription) {
        let existing = self.state.peers.read().await.get(&from).map(|e| {
            (e.phase, e.direction, e.remote_applied, e.connection.clone())
        });

        let connection = match existing {
            Some((PeerPhase::Negotiating, PeerDirection::Outbound, _, _)) if *local < from => {
                debug!("Offer glare with {}, keeping our offer", from.short());
                return;
            }
            // Handle created by an early candidate
            Some((PeerPhase::Negotiating, PeerDirection::Inbound, false, connection)) => connection,
            other => {
                match other {
                    Some((PeerPhase::Open, ..)) => {
                        info!("Peer {} sent a new offer, replacing connection", from.short());
                        self.events.peer_status(&from, false);
                    }
                    Some((PeerPhase::Negotiating, PeerDirection::Outbound, ..)) => {
                        debug!("Offer glare with {}, answering theirs", from.short());
                    }
                    _ => info!("Incoming connection from {}", from.short()),
                }
                match self.install(&from, PeerDirection::Inbound).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("{}", e);
                        return;
                    }
                }
            }
        };

        match connection.accept_offer(offer).await {
            Ok(answer) => {
                self.remote_applied(&from).await;
                if let Err(e) = self.rendezvous.send(SignalMessage::answer(local, &from, answer)) {
                    warn!("Failed to send answer to {}: {}", from.short(), e);
                }
            }
            Err(e) => {
                warn!("Failed to accept offer from {}: {}", from.short(), e);
                self.close_peer(&from, None, "offer rejected").await;
            }
        }
    }

    async fn on_answer(&mut self, from: PeerIdentifier, answer: SessionDescription) {
        let connection = {
            let peers = self.state.peers.read().await;
            match peers.get(&from) {
                Some(e)
                    if e.phase == PeerPhase::Negotiating
                        && e.direction == PeerDirection::Outbound
                        && !e.remote_applied =>
                {
                    e.connection.clone()
                }
                _ => {
                    debug!("Ignoring unexpected answer from {}", from.short());
                    return;
                }
            }
        };

        match connection.apply_answer(answer).await {
            Ok(()) => self.remote_applied(&from).await,
            Err(e) => {
                warn!("Failed to apply answer from {}: {}", from.short(), e);
                self.close_peer(&from, None, "answer rejected").await;
            }
        }
    }

    async fn on_candidate(&mut self, from: PeerIdentifier, candidate: IceCandidate) {
        let known = self.state.peers.read().await.contains_key(&from);
        if !known {
            debug!("Candidate from unknown peer {}, creating connection", from.short());
            if let Err(e) = self.install(&from, PeerDirection::Inbound).await {
                warn!("{}", e);
                return;
            }
        }

        let connection = {
            let mut peers = self.state.peers.write().await;
            let Some(entry) = peers.get_mut(&from) else {
                return;
            };
            if !entry.phase.is_live() {
                trace!("Ignoring candidate for closed peer {}", from.short());
                return;
            }
            entry.last_activity = Instant::now();
            if !entry.remote_applied {
                entry.pending_candidates.push(candidate);
                return;
            }
            entry.connection.clone()
        };

        if let Err(e) = connection.add_candidate(candidate).await {
            debug!("Failed to add candidate from {}: {}", from.short(), e);
        }
    }

    /// Mark the remote description applied and flush buffered candidates
    async fn remote_applied(&mut self, peer: &PeerIdentifier) {
        let (connection, pending) = {
            let mut peers = self.state.peers.write().await;
            let Some(entry) = peers.get_mut(peer) else {
                return;
            };
            entry.remote_applied = true;
            entry.last_activity = Instant::now();
            (
                entry.connection.clone(),
                std::mem::take(&mut entry.pending_candidates),
            )
        };

        if !pending.is_empty() {
            debug!("Applying {} buffered candidates from {}", pending.len(), peer.short());
        }
        for candidate in pending {
            if let Err(e) = connection.add_candidate(candidate).await {
                debug!("Failed to add candidate from {}: {}", peer.short(), e);
            }
        }
    }

    async fn is_current(&self, peer: &PeerIdentifier, generation: u64) -> bool {
        self.state
            .peers
            .read()
            .await
            .get(peer)
            .is_some_and(|e| e.generation == generation)
    }

    async fn on_sink_event(&mut self, event: SinkEvent) {
        let SinkEvent {
            peer,
            generation,
            event,
        } = event;

        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                if !self.is_current(&peer, generation).await {
                    return;
                }
                let local = self.local_id();
                if let Err(e) = self
                    .rendezvous
                    .send(SignalMessage::candidate(&local, &peer, candidate))
                {
                    warn!("Failed to send candidate to {}: {}", peer.short(), e);
                }
            }
            ConnectionEvent::ChannelOpen(channel) => {
                let opened = {
                    let mut peers = self.state.peers.write().await;
                    match peers.get_mut(&peer) {
                        Some(entry)
                            if entry.generation == generation
                                && entry.phase == PeerPhase::Negotiating =>
                        {
                            entry.phase = PeerPhase::Open;
                            entry.channel = Some(channel);
                            entry.deadline = None;
                            entry.last_activity = Instant::now();
                            true
                        }
                        _ => false,
                    }
                };
                if opened {
                    info!("Peer {} connected", peer.short());
                    self.events.peer_status(&peer, true);
                } else {
                    debug!("Ignoring stale channel for {}", peer.short());
                }
            }
            ConnectionEvent::Message(data) => {
                {
                    let mut peers = self.state.peers.write().await;
                    match peers.get_mut(&peer) {
                        Some(entry) if entry.generation == generation => {
                            entry.last_activity = Instant::now();
                        }
                        _ => return,
                    }
                }
                trace!("Received {} bytes from {}", data.len(), peer.short());
                self.events.message(&peer, data);
            }
            ConnectionEvent::ChannelClosed => {
                self.close_peer(&peer, Some(generation), "channel closed")
                    .await;
            }
        }
    }

    /// Move a live peer to `Closed` and notify. With a generation, only that
    /// handle's state is affected.
    async fn close_peer(&mut self, peer: &PeerIdentifier, generation: Option<u64>, reason: &str) {
        let connection = {
            let mut peers = self.state.peers.write().await;
            match peers.get_mut(peer) {
                Some(entry)
                    if entry.phase.is_live()
                        && generation.map_or(true, |g| g == entry.generation) =>
                {
                    entry.phase = PeerPhase::Closed;
                    entry.deadline = None;
                    entry.pending_candidates.clear();
                    entry.connection.clone()
                }
                _ => return,
            }
        };

        info!("Peer {} disconnected: {}", peer.short(), reason);
        self.events.peer_status(peer, false);
        if let Err(e) = connection.close().await {
            debug!("Closing connection to {} failed: {}", peer.short(), e);
        }
    }

    async fn expire_negotiations(&mut self) {
        let now = Instant::now();
        let expired: Vec<PeerIdentifier> = self
            .state
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.phase == PeerPhase::Negotiating && e.deadline.is_some_and(|d| d <= now))
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in expired {
            warn!("Negotiation with {} timed out", peer.short());
            self.close_peer(&peer, None, "negotiation timed out").await;
        }
    }
}

async fn retire(peer: &PeerIdentifier, entry: PeerEntry) {
    if let Err(e) = entry.connection.close().await {
        debug!("Closing connection to {} failed: {}", peer.short(), e);
    }
}
