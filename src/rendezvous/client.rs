//! Rendezvous client
//!
//! A single task owns the relay socket, the outbound queue and the reconnect
//! timer. [`RendezvousClient`] is a cheap handle that talks to that task over
//! a channel, so every method is non-blocking and all socket access is
//! serialized.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::types::{LinkStatus, PeerIdentifier, RendezvousConfig, SignalMessage};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream>> + Send>>;

/// Callback invoked for every inbound frame, whoever it is addressed to
pub type Listener = Arc<dyn Fn(&SignalMessage) + Send + Sync>;

enum Command {
    Connect,
    Send(SignalMessage),
    Shutdown,
}

struct Shared {
    config: RendezvousConfig,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    local_id: watch::Sender<Option<PeerIdentifier>>,
    status: watch::Sender<LinkStatus>,
}

impl Shared {
    fn dispatch(&self, msg: &SignalMessage) {
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(guard) => guard.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(msg);
        }
    }
}

/// Handle returned by [`RendezvousClient::on`]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the listener this subscription was created for
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut listeners) = shared.listeners.write() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Client side of the rendezvous relay
#[derive(Clone)]
pub struct RendezvousClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RendezvousClient {
    /// Create the client and spawn its socket task. Does not connect yet.
    pub fn new(config: RendezvousConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (local_id, _) = watch::channel(None);
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        let shared = Arc::new(Shared {
            config,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            local_id,
            status,
        });

        tokio::spawn(run_socket_task(shared.clone(), command_rx));

        Self { commands, shared }
    }

    /// Open the relay socket unless it is already open or opening
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Queue a frame for delivery. Frames sent while disconnected are kept
    /// and delivered once a reconnect succeeds.
    pub fn send(&self, msg: SignalMessage) -> Result<(), TransportError> {
        self.commands
            .send(Command::Send(msg))
            .map_err(|_| TransportError::RendezvousClosed)
    }

    /// Register a listener for every inbound frame
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SignalMessage) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.shared.listeners.write() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Session identifier assigned by the relay, if a session is open
    pub fn local_id(&self) -> Option<PeerIdentifier> {
        self.shared.local_id.borrow().clone()
    }

    /// Wait until the relay has assigned a session identifier
    pub async fn wait_for_id(&self, timeout: Duration) -> Option<PeerIdentifier> {
        let mut rx = self.shared.local_id.subscribe();
        let id = match tokio::time::timeout(timeout, rx.wait_for(|id| id.is_some())).await {
            Ok(Ok(id)) => id.clone(),
            _ => None,
        };
        id
    }

    pub fn status(&self) -> LinkStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    pub fn join(&self, room_id: &str) -> Result<(), TransportError> {
        self.send(SignalMessage::Join {
            room_id: room_id.to_string(),
        })
    }

    pub fn leave(&self, room_id: &str) -> Result<(), TransportError> {
        self.send(SignalMessage::Leave {
            room_id: room_id.to_string(),
        })
    }

    /// Broadcast a payload to the other members of a room
    pub fn relay(&self, room_id: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        self.send(SignalMessage::Relay {
            room_id: Some(room_id.to_string()),
            from: None,
            payload,
        })
    }

    /// Close the socket and stop the client task
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn open_socket(url: String, timeout: Duration) -> Result<WsStream> {
    let (ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", url))??;
    Ok(ws)
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream> {
    match connecting {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn write_frame(ws: &mut WsStream, msg: &SignalMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

struct SocketTask {
    shared: Arc<Shared>,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    retry_at: Option<Instant>,
    backoff: Duration,
    outbox: VecDeque<SignalMessage>,
}

impl SocketTask {
    fn base_delay(&self) -> Duration {
        Duration::from_millis(self.shared.config.retry_delay_ms)
    }

    fn start_connect(&mut self) {
        if self.socket.is_some() || self.connecting.is_some() {
            return;
        }
        let url = self.shared.config.url.clone();
        debug!("Connecting to rendezvous relay {}", url);
        self.retry_at = None;
        self.shared.status.send_replace(LinkStatus::Connecting);
        let timeout = Duration::from_millis(self.shared.config.connect_timeout_ms);
        self.connecting = Some(Box::pin(open_socket(url, timeout)));
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_some() || self.connecting.is_some() {
            return;
        }
        self.retry_at = Some(Instant::now() + self.backoff);
        let max = Duration::from_millis(self.shared.config.max_retry_delay_ms);
        self.backoff = (self.backoff * 2).min(max);
    }

    fn enqueue(&mut self, msg: SignalMessage) {
        if self.outbox.len() >= self.shared.config.max_pending {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!(
                    "Rendezvous queue full ({}), dropping oldest {} frame",
                    self.shared.config.max_pending,
                    dropped.msg_type()
                );
            }
        }
        self.outbox.push_back(msg);
    }

    fn socket_lost(&mut self, reconnect: bool) {
        self.socket = None;
        self.shared.local_id.send_replace(None);
        self.shared.status.send_replace(LinkStatus::Disconnected);
        if reconnect || !self.outbox.is_empty() {
            self.schedule_retry();
        }
    }

    async fn send_now(&mut self, msg: SignalMessage) {
        let Some(ws) = self.socket.as_mut() else {
            self.enqueue(msg);
            self.schedule_retry();
            return;
        };
        match write_frame(ws, &msg).await {
            Ok(()) => trace!("Sent {} frame", msg.msg_type()),
            Err(e) => {
                warn!("Rendezvous write failed: {}", e);
                self.outbox.push_front(msg);
                let reconnect = self.shared.config.auto_reconnect;
                self.socket_lost(reconnect);
            }
        }
    }

    async fn flush(&mut self) {
        while self.socket.is_some() {
            let Some(msg) = self.outbox.pop_front() else {
                break;
            };
            self.send_now(msg).await;
        }
    }

    async fn on_connected(&mut self, ws: WsStream) {
        info!("Connected to rendezvous relay {}", self.shared.config.url);
        self.socket = Some(ws);
        self.backoff = self.base_delay();
        self.retry_at = None;
        self.shared.status.send_replace(LinkStatus::Open);
        if !self.outbox.is_empty() {
            debug!("Flushing {} queued frames", self.outbox.len());
        }
        self.flush().await;
    }

    async fn on_frame(&mut self, text: &str) {
        let msg: SignalMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("Dropping malformed rendezvous frame: {}", e);
                return;
            }
        };

        if let SignalMessage::Welcome { client_id } = &msg {
            info!("Rendezvous session id: {}", client_id);
            self.shared.local_id.send_replace(Some(client_id.clone()));
            if let Some(public_key) = self.shared.config.public_key.clone() {
                self.send_now(SignalMessage::RegisterPublicKey { public_key })
                    .await;
            }
        }

        self.shared.dispatch(&msg);
    }
}

async fn run_socket_task(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let backoff = Duration::from_millis(shared.config.retry_delay_ms);
    let mut task = SocketTask {
        shared,
        socket: None,
        connecting: None,
        retry_at: None,
        backoff,
        outbox: VecDeque::new(),
    };

    loop {
        let retry_deadline = task.retry_at.unwrap_or_else(Instant::now);
        let retrying = task.retry_at.is_some();
        let connecting = task.connecting.is_some();
        let open = task.socket.is_some();

        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Connect) => task.start_connect(),
                    Some(Command::Send(msg)) => task.send_now(msg).await,
                    Some(Command::Shutdown) | None => break,
                }
            }
            result = poll_connect(&mut task.connecting), if connecting => {
                task.connecting = None;
                match result {
                    Ok(ws) => task.on_connected(ws).await,
                    Err(e) => {
                        warn!("Rendezvous connect failed: {}", e);
                        task.shared.status.send_replace(LinkStatus::Disconnected);
                        if task.shared.config.auto_reconnect || !task.outbox.is_empty() {
                            task.schedule_retry();
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(retry_deadline), if retrying => {
                task.retry_at = None;
                task.start_connect();
            }
            frame = next_frame(&mut task.socket), if open => {
                match frame {
                    Some(Ok(Message::Text(text))) => task.on_frame(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Rendezvous socket closed");
                        let reconnect = task.shared.config.auto_reconnect;
                        task.socket_lost(reconnect);
                    }
                    Some(Err(e)) => {
                        warn!("Rendezvous socket error: {}", e);
                        let reconnect = task.shared.config.auto_reconnect;
                        task.socket_lost(reconnect);
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(mut ws) = task.socket.take() {
        let _ = ws.close(None).await;
    }
    task.shared.local_id.send_replace(None);
    task.shared.status.send_replace(LinkStatus::Disconnected);
    debug!("Rendezvous client task stopped");
}
