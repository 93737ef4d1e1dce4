//! Rendezvous relay server
//!
//! Assigns each WebSocket session an identifier, forwards peer-addressed
//! frames to their recipient and fans room traffic out to room members.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tracing::{debug, info, trace, warn};

use super::types::{PeerIdentifier, SignalMessage};

/// Outbound frames buffered per session before the relay starts dropping
const SESSION_BUFFER: usize = 256;

struct ClientSlot {
    tx: mpsc::Sender<String>,
    public_key: Option<String>,
    kick: Arc<Notify>,
}

struct RelayInner {
    clients: RwLock<HashMap<PeerIdentifier, ClientSlot>>,
    rooms: RwLock<HashMap<String, HashSet<PeerIdentifier>>>,
    closing: watch::Sender<bool>,
}

/// Relay state shared by all sessions
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

impl Default for RelayState {
    fn default() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(RelayInner {
                clients: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                closing,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub clients: usize,
    pub rooms: usize,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            clients: self.inner.clients.read().await.len(),
            rooms: self.inner.rooms.read().await.len(),
        }
    }

    /// Public key announced by a session, if any
    pub async fn public_key(&self, id: &PeerIdentifier) -> Option<String> {
        self.inner
            .clients
            .read()
            .await
            .get(id)
            .and_then(|slot| slot.public_key.clone())
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<PeerIdentifier> {
        let mut members: Vec<PeerIdentifier> = self
            .inner
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Drop one session's socket. Returns whether the session existed.
    pub async fn close_session(&self, id: &PeerIdentifier) -> bool {
        match self.inner.clients.read().await.get(id) {
            Some(slot) => {
                slot.kick.notify_one();
                true
            }
            None => false,
        }
    }

    /// Drop every open session and refuse to keep new ones
    pub fn close_all(&self) {
        self.inner.closing.send_replace(true);
    }

    async fn deliver(&self, to: &PeerIdentifier, msg: &SignalMessage) -> bool {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} frame: {}", msg.msg_type(), e);
                return false;
            }
        };
        let tx = match self.inner.clients.read().await.get(to) {
            Some(slot) => slot.tx.clone(),
            None => return false,
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Session {} is not keeping up, dropping {} frame", to.short(), msg.msg_type());
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn broadcast(&self, members: &[PeerIdentifier], msg: &SignalMessage) {
        for member in members {
            self.deliver(member, msg).await;
        }
    }

    async fn join(&self, id: &PeerIdentifier, room_id: String) {
        let members: Vec<PeerIdentifier> = {
            let mut rooms = self.inner.rooms.write().await;
            let room = rooms.entry(room_id.clone()).or_default();
            if !room.insert(id.clone()) {
                trace!("{} already in room {}", id.short(), room_id);
                return;
            }
            room.iter().cloned().collect()
        };
        debug!("{} joined room {} ({} members)", id.short(), room_id, members.len());
        let presence = SignalMessage::Presence {
            id: id.clone(),
            joined: true,
            room_id: Some(room_id),
        };
        self.broadcast(&members, &presence).await;
    }

    async fn leave(&self, id: &PeerIdentifier, room_id: &str) {
        let remaining: Vec<PeerIdentifier> = {
            let mut rooms = self.inner.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                return;
            };
            if !room.remove(id) {
                return;
            }
            let remaining = room.iter().cloned().collect();
            if room.is_empty() {
                rooms.remove(room_id);
            }
            remaining
        };
        debug!("{} left room {}", id.short(), room_id);
        let presence = SignalMessage::Presence {
            id: id.clone(),
            joined: false,
            room_id: Some(room_id.to_string()),
        };
        self.broadcast(&remaining, &presence).await;
    }

    async fn relay(&self, from: &PeerIdentifier, room_id: String, payload: serde_json::Value) {
        let others: Vec<PeerIdentifier> = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(&room_id) {
                Some(room) if room.contains(from) => {
                    room.iter().filter(|m| *m != from).cloned().collect()
                }
                _ => {
                    debug!("Dropping relay from non-member {} to {}", from.short(), room_id);
                    return;
                }
            }
        };
        let msg = SignalMessage::Relay {
            room_id: Some(room_id),
            from: Some(from.clone()),
            payload,
        };
        self.broadcast(&others, &msg).await;
    }

    async fn register(&self, id: PeerIdentifier, tx: mpsc::Sender<String>, kick: Arc<Notify>) {
        self.inner.clients.write().await.insert(
            id,
            ClientSlot {
                tx,
                public_key: None,
                kick,
            },
        );
    }

    async fn unregister(&self, id: &PeerIdentifier) {
        self.inner.clients.write().await.remove(id);
        let rooms: Vec<String> = self
            .inner
            .rooms
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room_id, _)| room_id.clone())
            .collect();
        for room_id in rooms {
            self.leave(id, &room_id).await;
        }
    }

    async fn handle_frame(&self, id: &PeerIdentifier, text: &str) {
        let mut msg: SignalMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("Dropping malformed frame from {}: {}", id.short(), e);
                return;
            }
        };

        match msg {
            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }
            | SignalMessage::DataFallback { .. } => {
                msg.set_sender(id.clone());
                let Some(to) = msg.recipient().cloned() else {
                    return;
                };
                if self.deliver(&to, &msg).await {
                    trace!("Routed {} {} -> {}", msg.msg_type(), id.short(), to.short());
                } else {
                    debug!("Dropping {} for unknown recipient {}", msg.msg_type(), to.short());
                }
            }
            SignalMessage::RegisterPublicKey { public_key } => {
                debug!("{} registered public key", id.short());
                if let Some(slot) = self.inner.clients.write().await.get_mut(id) {
                    slot.public_key = Some(public_key);
                }
            }
            SignalMessage::Join { room_id } => self.join(id, room_id).await,
            SignalMessage::Leave { room_id } => self.leave(id, &room_id).await,
            SignalMessage::Relay {
                room_id: Some(room_id),
                payload,
                ..
            } => self.relay(id, room_id, payload).await,
            other => trace!("Ignoring {} frame from {}", other.msg_type(), id.short()),
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.stats().await)
}

/// Handle a single relay session
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_BUFFER);
    let id = PeerIdentifier::generate();
    let kick = Arc::new(Notify::new());
    let mut closing = state.inner.closing.subscribe();
    if *closing.borrow() {
        debug!("Relay shutting down, refusing new session");
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    state.register(id.clone(), tx, kick.clone()).await;
    info!("Rendezvous session {} opened", id.short());
    state
        .deliver(&id, &SignalMessage::Welcome { client_id: id.clone() })
        .await;

    loop {
        let result = tokio::select! {
            _ = kick.notified() => {
                debug!("Closing session {} on request", id.short());
                break;
            }
            _ = closing.wait_for(|closing| *closing) => {
                debug!("Relay shutting down, closing session {}", id.short());
                break;
            }
            result = receiver.next() => result,
        };
        let text = match result {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", id.short(), e);
                break;
            }
        };
        state.handle_frame(&id, &text).await;
    }

    state.unregister(&id).await;
    send_task.abort();
    info!("Rendezvous session {} closed", id.short());
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", any(ws_handler))
        .route("/ws", any(ws_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Running relay server
pub struct RelayHandle {
    pub addr: SocketAddr,
    pub state: RelayState,
    shutdown: Arc<Notify>,
}

impl RelayHandle {
    /// WebSocket URL clients should connect to
    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Stop accepting connections and close every open session
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
        self.state.close_all();
    }
}

/// Bind and start a relay server in the background
pub async fn start_relay_server(addr: SocketAddr) -> anyhow::Result<RelayHandle> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let state = RelayState::new();
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    let app = router(state.clone());

    info!("Rendezvous relay listening on {}", bound_addr);

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_signal.notified().await })
            .await;
        if let Err(e) = served {
            warn!("Rendezvous relay stopped: {}", e);
        }
    });

    Ok(RelayHandle {
        addr: bound_addr,
        state,
        shutdown,
    })
}
