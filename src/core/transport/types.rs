//! Transport-facing value types: session descriptions, candidates, and the
//! events a transport session reports back to its owner.
//!
//! Pure data; shapes match what browsers put on the rendezvous wire so a
//! native peer and a browser peer can negotiate with each other.

use super::DataStream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ── Negotiation payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob plus its role, serialized as `{"type": "...", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One trickled address candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ── Transport events ──────────────────────────────────────────────────────────

/// Connection-level state reported by a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Disconnected, failed and closed all end the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Everything a transport session reports asynchronously.
pub enum TransportEvent {
    /// A local candidate to relay to the remote party.
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// The remote party opened a data stream towards us.
    RemoteStream(Arc<dyn DataStream>),
    StreamOpen { label: String },
    StreamClosed { label: String },
    StreamMessage { label: String, data: Bytes },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::RemoteStream(s) => f.debug_tuple("RemoteStream").field(&s.label()).finish(),
            Self::StreamOpen { label } => f.debug_struct("StreamOpen").field("label", label).finish(),
            Self::StreamClosed { label } => {
                f.debug_struct("StreamClosed").field("label", label).finish()
            }
            Self::StreamMessage { label, data } => f
                .debug_struct("StreamMessage")
                .field("label", label)
                .field("bytes", &data.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_browser_field_names() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn candidate_parses_browser_shape() {
        let c: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert!(c.username_fragment.is_none());
    }

    #[test]
    fn only_connected_and_connecting_are_live() {
        assert!(!TransportState::Connected.is_terminal());
        assert!(!TransportState::Connecting.is_terminal());
        assert!(TransportState::Disconnected.is_terminal());
        assert!(TransportState::Failed.is_terminal());
        assert!(TransportState::Closed.is_terminal());
    }
}
