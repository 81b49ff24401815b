//! Transport-level data types: descriptions, candidates, states, events.
//!
//! This module is a pure data layer. Everything that crosses the signaling
//! relay is `Serialize`/`Deserialize` with the field names browsers use, so a
//! relay can forward the JSON untouched.

use super::DataChannel;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Signaling ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Messages ferried by the external signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl From<SessionDescription> for SignalingMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpType::Offer => Self::Offer { sdp: desc.sdp },
            SdpType::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

// ── States ────────────────────────────────────────────────────────────────────

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// One message on a data channel. Message boundaries are preserved by the
/// channel, so no length prefix is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything a transport can report about one peer connection.
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
    /// A local ICE candidate that must be relayed to the remote peer.
    LocalCandidate(IceCandidate),
    /// The remote side opened a data channel (responder role).
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    Message(ChannelMessage),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionStateChanged(s) => f.debug_tuple("ConnectionStateChanged").field(s).finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::IncomingChannel(dc) => f.debug_tuple("IncomingChannel").field(&dc.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
            Self::Message(m) => write!(f, "Message({} bytes)", m.len()),
        }
    }
}

/// A transport event tagged with the connection it belongs to.
#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: String,
    /// Distinguishes successive connections to the same peer id.
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half of the session's transport event queue, bound to one
/// peer connection.
#[derive(Clone)]
pub struct TransportEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl TransportEvents {
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue an event; silently drops it once the session is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_wire_shape() {
        let offer = SignalingMessage::Offer { sdp: "v=0".into() };
        assert_eq!(offer.to_json().unwrap(), r#"{"type":"offer","sdp":"v=0"}"#);

        let cand = SignalingMessage::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let json = cand.to_json().unwrap();
        assert!(json.starts_with(r#"{"type":"ice-candidate","candidate":{"#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(!json.contains("usernameFragment"));
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), cand);
    }

    #[test]
    fn test_browser_candidate_parses() {
        let json = r#"{"type":"ice-candidate","candidate":{"candidate":"c","sdpMid":null,"sdpMLineIndex":null}}"#;
        match SignalingMessage::from_json(json).unwrap() {
            SignalingMessage::IceCandidate { candidate } => {
                assert_eq!(candidate.candidate, "c");
                assert_eq!(candidate.sdp_mid, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_description_into_signal() {
        let msg: SignalingMessage = SessionDescription::answer("a").into();
        assert_eq!(msg, SignalingMessage::Answer { sdp: "a".into() });
    }
}
