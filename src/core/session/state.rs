//! Peer session state values and their pure transitions.

use crate::core::transport::{DataStream, IceCandidate, TransportSession, TransportState};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    /// We created the offer and wait for the answer.
    Offering,
    /// We received an offer and are producing the answer.
    Answering,
    /// Both descriptions are in place; waiting for connectivity.
    Negotiating,
    Connected,
    /// Terminal. Disconnected, failed and closed all end here.
    Disconnected,
}

/// Inputs that move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    OfferSent,
    OfferReceived,
    AnswerApplied,
    AnswerSent,
    Transport(TransportState),
    Closed,
}

impl SessionState {
    /// Next state for `input`, or `None` when the input does not apply.
    pub fn apply(self, input: SessionInput) -> Option<SessionState> {
        use SessionInput as I;
        use SessionState as S;

        match (self, input) {
            (S::Disconnected, _) => None,
            (_, I::Closed) => Some(S::Disconnected),
            (_, I::Transport(t)) if t.is_terminal() => Some(S::Disconnected),
            (S::New, I::OfferSent) => Some(S::Offering),
            (S::New, I::OfferReceived) => Some(S::Answering),
            (S::Offering, I::AnswerApplied) => Some(S::Negotiating),
            (S::Answering, I::AnswerSent) => Some(S::Negotiating),
            (S::Offering | S::Answering | S::Negotiating, I::Transport(TransportState::Connected)) => {
                Some(S::Connected)
            }
            (_, I::Transport(TransportState::Connecting)) => Some(self),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    Closed,
}

impl StreamState {
    pub fn open(self) -> Option<StreamState> {
        match self {
            StreamState::Opening => Some(StreamState::Open),
            _ => None,
        }
    }

    pub fn close(self) -> Option<StreamState> {
        match self {
            StreamState::Opening | StreamState::Open => Some(StreamState::Closed),
            StreamState::Closed => None,
        }
    }
}

/// One entry of the negotiator's session table.
pub struct PeerSession {
    pub peer_id: String,
    /// Generation tag; events carrying a different id belong to a replaced
    /// session and are dropped.
    pub session_id: Uuid,
    pub state: SessionState,
    pub stream_state: StreamState,
    pub transport: Arc<dyn TransportSession>,
    pub stream: Option<Arc<dyn DataStream>>,
    pub remote_description_set: bool,
    /// Candidates that arrived before the remote description.
    pub pending_candidates: Vec<IceCandidate>,
}

impl PeerSession {
    pub fn new(peer_id: impl Into<String>, transport: Arc<dyn TransportSession>) -> Self {
        Self {
            peer_id: peer_id.into(),
            session_id: Uuid::new_v4(),
            state: SessionState::New,
            stream_state: StreamState::Opening,
            transport,
            stream: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    /// Apply `input`, returning the new state when it changed.
    pub fn advance(&mut self, input: SessionInput) -> Option<SessionState> {
        let next = self.state.apply(input)?;
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
