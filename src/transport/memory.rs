//! In-process connection network
//!
//! Pairs offers and answers by a session token carried in the SDP, so two
//! managers in the same process negotiate through a real rendezvous relay
//! while their data channels are plain in-memory queues. A stalled network
//! completes the offer/answer exchange but never opens a channel.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::handle::{ConnectionEvent, ConnectionFactory, DataChannel, EventSink, NegotiatedConnection};
use crate::rendezvous::{generate_uuid, IceCandidate, SessionDescription};

const SDP_PREFIX: &str = "memory:";

struct Session {
    offerer: EventSink,
    offerer_channel: Option<Arc<MemoryChannel>>,
    answerer: Option<(EventSink, Arc<MemoryChannel>)>,
}

/// Shared in-process network; hand the same instance to every factory
#[derive(Default)]
pub struct MemoryNetwork {
    sessions: Mutex<HashMap<String, Session>>,
    stalled: AtomicBool,
    open_channels: AtomicUsize,
    connections: AtomicUsize,
    remote_candidates: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network whose channels never open
    pub fn stalled() -> Arc<Self> {
        let network = Self::default();
        network.stalled.store(true, Ordering::SeqCst);
        Arc::new(network)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn factory(self: &Arc<Self>) -> MemoryFactory {
        MemoryFactory {
            network: self.clone(),
        }
    }

    /// Number of channel pairs currently open
    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    /// Number of connection handles created by this network's factories
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Remote candidates applied across all handles
    pub fn remote_candidates(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("memory network lock poisoned"))
    }
}

fn token_of(desc: &SessionDescription) -> Result<&str> {
    desc.sdp
        .strip_prefix(SDP_PREFIX)
        .ok_or_else(|| anyhow!("not a memory session description"))
}

/// One end of an in-memory data channel pair
pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    network: Arc<MemoryNetwork>,
    local: EventSink,
    remote: EventSink,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            bail!("memory channel closed");
        }
        self.remote.emit(ConnectionEvent::Message(data));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.network.open_channels.fetch_sub(1, Ordering::SeqCst);
            self.local.emit(ConnectionEvent::ChannelClosed);
            self.remote.emit(ConnectionEvent::ChannelClosed);
        }
        Ok(())
    }
}

pub struct MemoryConnection {
    network: Arc<MemoryNetwork>,
    sink: EventSink,
    token: Mutex<Option<String>>,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    wants_channel: AtomicBool,
}

impl MemoryConnection {
    fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }
    }

    fn set_channel(&self, channel: Arc<MemoryChannel>) {
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel);
        }
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 UDP 2130706431 127.0.0.1 9 typ host",
                self.sink.generation()
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[async_trait]
impl NegotiatedConnection for MemoryConnection {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        trace!("Memory data channel '{}' requested", label);
        self.wants_channel.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if !self.wants_channel.load(Ordering::SeqCst) {
            bail!("offer without a data channel");
        }
        let token = generate_uuid();
        self.network.lock()?.insert(
            token.clone(),
            Session {
                offerer: self.sink.clone(),
                offerer_channel: None,
                answerer: None,
            },
        );
        self.set_token(token.clone());
        self.sink
            .emit(ConnectionEvent::LocalCandidate(self.host_candidate()));
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, token)))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let token = token_of(&offer)?.to_string();
        let open = Arc::new(AtomicBool::new(false));
        {
            let mut sessions = self.network.lock()?;
            let session = sessions
                .get_mut(&token)
                .ok_or_else(|| anyhow!("unknown memory session {}", token))?;
            if session.answerer.is_some() {
                bail!("memory session {} already answered", token);
            }
            let offerer_end = Arc::new(MemoryChannel {
                open: open.clone(),
                network: self.network.clone(),
                local: session.offerer.clone(),
                remote: self.sink.clone(),
            });
            let answerer_end = Arc::new(MemoryChannel {
                open,
                network: self.network.clone(),
                local: self.sink.clone(),
                remote: session.offerer.clone(),
            });
            session.offerer_channel = Some(offerer_end);
            session.answerer = Some((self.sink.clone(), answerer_end.clone()));
            self.set_channel(answerer_end);
        }
        self.set_token(token.clone());
        self.sink
            .emit(ConnectionEvent::LocalCandidate(self.host_candidate()));
        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, token)))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        let token = token_of(&answer)?.to_string();
        let own = self.token.lock().ok().and_then(|t| t.clone());
        if own.as_deref() != Some(token.as_str()) {
            bail!("answer does not match our offer");
        }
        let session = self
            .network
            .lock()?
            .remove(&token)
            .ok_or_else(|| anyhow!("unknown memory session {}", token))?;
        let (answerer_sink, answerer_end) = session
            .answerer
            .ok_or_else(|| anyhow!("memory session {} not answered", token))?;
        let offerer_end = session
            .offerer_channel
            .ok_or_else(|| anyhow!("memory session {} has no channel", token))?;
        self.set_channel(offerer_end.clone());

        if self.network.stalled.load(Ordering::SeqCst) {
            trace!("Memory network stalled, channel {} stays closed", token);
            return Ok(());
        }

        offerer_end.open.store(true, Ordering::SeqCst);
        self.network.open_channels.fetch_add(1, Ordering::SeqCst);
        session.offerer.emit(ConnectionEvent::ChannelOpen(offerer_end));
        answerer_sink.emit(ConnectionEvent::ChannelOpen(answerer_end));
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            bail!("empty candidate");
        }
        self.network.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().ok().and_then(|c| c.clone());
        if let Some(channel) = channel {
            channel.close().await?;
        }
        let token = self.token.lock().ok().and_then(|t| t.clone());
        if let Some(token) = token {
            self.network.lock()?.remove(&token);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryFactory {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn NegotiatedConnection>> {
        self.network.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            network: self.network.clone(),
            sink,
            token: Mutex::new(None),
            channel: Mutex::new(None),
            wants_channel: AtomicBool::new(false),
        }))
    }
}
