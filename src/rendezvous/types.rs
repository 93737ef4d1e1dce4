//! Rendezvous wire types
//!
//! Every frame on the relay socket is a JSON object tagged by `type`.
//! Peer-addressed frames carry `from`/`to` session identifiers; room frames
//! carry a `roomId`. Types we do not know decode to [`SignalMessage::Unknown`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Channel label used for the application data channel
pub const DATA_CHANNEL_LABEL: &str = "meshlink";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random base36 session identifier
pub fn generate_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..30)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Ephemeral, relay-assigned session identifier.
///
/// Not related to the persistent identity in [`crate::identity`]: a new relay
/// session always yields a new identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentifier(String);

impl PeerIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (used by the relay when assigning sessions)
    pub fn generate() -> Self {
        Self(generate_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged in OFFER/ANSWER frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        let engine = base64::engine::general_purpose::STANDARD;
        serializer.serialize_str(&engine.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let engine = base64::engine::general_purpose::STANDARD;
        engine
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// All rendezvous frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "clientId")]
        client_id: PeerIdentifier,
    },
    #[serde(rename = "registerPublicKey")]
    RegisterPublicKey {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "OFFER", alias = "RTC_OFFER")]
    Offer {
        #[serde(default)]
        from: PeerIdentifier,
        to: PeerIdentifier,
        data: SessionDescription,
    },
    #[serde(rename = "ANSWER", alias = "RTC_ANSWER")]
    Answer {
        #[serde(default)]
        from: PeerIdentifier,
        to: PeerIdentifier,
        data: SessionDescription,
    },
    #[serde(rename = "ICE_CANDIDATE", alias = "RTC_ICE")]
    IceCandidate {
        #[serde(default)]
        from: PeerIdentifier,
        to: PeerIdentifier,
        data: IceCandidate,
    },
    #[serde(rename = "DATA_FALLBACK")]
    DataFallback {
        #[serde(default)]
        from: PeerIdentifier,
        to: PeerIdentifier,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "presence")]
    Presence {
        id: PeerIdentifier,
        joined: bool,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    #[serde(rename = "relay")]
    Relay {
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerIdentifier>,
        payload: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalMessage::Welcome { .. } => "welcome",
            SignalMessage::RegisterPublicKey { .. } => "registerPublicKey",
            SignalMessage::Offer { .. } => "OFFER",
            SignalMessage::Answer { .. } => "ANSWER",
            SignalMessage::IceCandidate { .. } => "ICE_CANDIDATE",
            SignalMessage::DataFallback { .. } => "DATA_FALLBACK",
            SignalMessage::Join { .. } => "join",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::Presence { .. } => "presence",
            SignalMessage::Relay { .. } => "relay",
            SignalMessage::Unknown => "unknown",
        }
    }

    /// Addressed recipient, for peer-to-peer frames only
    pub fn recipient(&self) -> Option<&PeerIdentifier> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. }
            | SignalMessage::DataFallback { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&PeerIdentifier> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. }
            | SignalMessage::DataFallback { from, .. } => Some(from),
            SignalMessage::Relay { from, .. } => from.as_ref(),
            _ => None,
        }
    }

    /// Overwrite the sender of a peer-addressed frame
    pub fn set_sender(&mut self, sender: PeerIdentifier) {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. }
            | SignalMessage::DataFallback { from, .. } => *from = sender,
            SignalMessage::Relay { from, .. } => *from = Some(sender),
            _ => {}
        }
    }

    pub fn offer(from: &PeerIdentifier, to: &PeerIdentifier, data: SessionDescription) -> Self {
        SignalMessage::Offer {
            from: from.clone(),
            to: to.clone(),
            data,
        }
    }

    pub fn answer(from: &PeerIdentifier, to: &PeerIdentifier, data: SessionDescription) -> Self {
        SignalMessage::Answer {
            from: from.clone(),
            to: to.clone(),
            data,
        }
    }

    pub fn candidate(from: &PeerIdentifier, to: &PeerIdentifier, data: IceCandidate) -> Self {
        SignalMessage::IceCandidate {
            from: from.clone(),
            to: to.clone(),
            data,
        }
    }

    pub fn fallback(from: &PeerIdentifier, to: &PeerIdentifier, data: Bytes) -> Self {
        SignalMessage::DataFallback {
            from: from.clone(),
            to: to.clone(),
            data,
        }
    }
}

/// Configuration for the rendezvous client
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Timeout for a single connection attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// First retry delay after a failed attempt or a send while disconnected
    pub retry_delay_ms: u64,
    /// Upper bound for the exponential retry delay
    pub max_retry_delay_ms: u64,
    /// Maximum number of queued outbound frames while disconnected
    pub max_pending: usize,
    /// Reconnect automatically after an established socket drops
    pub auto_reconnect: bool,
    /// Persistent public key announced after `welcome`
    pub public_key: Option<String>,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/".to_string(),
            connect_timeout_ms: 10_000,
            retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
            max_pending: 1024,
            auto_reconnect: true,
            public_key: None,
        }
    }
}

/// Link state of the rendezvous socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Open,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "disconnected"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Open => write!(f, "open"),
        }
    }
}
