//! WebRTC-backed negotiated connections

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::handle::{ConnectionEvent, ConnectionFactory, DataChannel, EventSink, NegotiatedConnection};
use crate::rendezvous::{IceCandidate, SessionDescription};

/// Data channel over an `RTCDataChannel`
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl WebRtcConnection {
    async fn new(sink: EventSink, stun_servers: &[String]) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let conn = Self {
            pc,
            sink,
            data_channel: Mutex::new(None),
        };
        conn.setup_handlers();
        Ok(conn)
    }

    fn setup_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => sink.emit(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    info!("Peer {} connection state: {:?}", sink.peer().short(), state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        sink.emit(ConnectionEvent::ChannelClosed);
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                Box::pin(async move {
                    info!("Peer {} received data channel: {}", sink.peer().short(), dc.label());
                    setup_dc_handlers(dc, sink);
                })
            }));
    }
}

/// Wire a data channel's callbacks into the sink (shared by both sides)
fn setup_dc_handlers(dc: Arc<RTCDataChannel>, sink: EventSink) {
    let label = dc.label().to_string();

    let dc_for_open = dc.clone();
    let sink_open = sink.clone();
    dc.on_open(Box::new(move || {
        info!("[Peer {}] Data channel '{}' open", sink_open.peer().short(), label);
        sink_open.emit(ConnectionEvent::ChannelOpen(Arc::new(WebRtcChannel {
            dc: dc_for_open.clone(),
        })));
        Box::pin(async {})
    }));

    let sink_msg = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        trace!("[Peer {}] Received {} bytes", sink_msg.peer().short(), msg.data.len());
        sink_msg.emit(ConnectionEvent::Message(msg.data));
        Box::pin(async {})
    }));

    let sink_close = sink;
    dc.on_close(Box::new(move || {
        debug!("[Peer {}] Data channel closed", sink_close.peer().short());
        sink_close.emit(ConnectionEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    use crate::rendezvous::SdpType;
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => return Err(anyhow!("rollback descriptions are not supported")),
    };
    Ok(rtc)
}

#[async_trait]
impl NegotiatedConnection for WebRtcConnection {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        let dc = self.pc.create_data_channel(label, None).await?;
        setup_dc_handlers(dc.clone(), self.sink.clone());
        *self.data_channel.lock().await = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.pc.set_remote_description(to_rtc(offer)?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(answer)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(dc) = self.data_channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}

/// Creates WebRTC peer connections with the configured STUN servers
#[derive(Clone)]
pub struct WebRtcFactory {
    stun_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn NegotiatedConnection>> {
        let conn = WebRtcConnection::new(sink, &self.stun_servers).await?;
        Ok(Arc::new(conn))
    }
}
