//! SessionNegotiator: turns a rendezvous pairing into a live transport
//! session plus one data stream, one session per remote peer.
//!
//! The session table is the single source of truth. Every operation and
//! every transport event takes the table lock and runs to completion, so a
//! session never observes interleaved transitions. Each session's transport
//! events are pumped by a task tagged with the session's id; once the entry
//! is replaced or removed the pump stops.

use super::state::{PeerSession, SessionInput, SessionState};
use crate::core::config::DATA_STREAM_LABEL;
use crate::core::error::NegotiationError;
use crate::core::events::{EventBus, Subscription};
use crate::core::rendezvous::{ClientMessage, SignalSink};
use crate::core::transfer::DataStreamRouter;
use crate::core::transport::{
    IceCandidate, SessionDescription, TransportEvent, TransportFactory, TransportSession,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    DataStreamOpen(String),
    DataStreamClose(String),
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    signal: Arc<dyn SignalSink>,
    router: Arc<DataStreamRouter>,
    events: EventBus<PeerEvent>,
    sessions: Mutex<HashMap<String, PeerSession>>,
    client_id: parking_lot::Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct SessionNegotiator {
    inner: Arc<Inner>,
}

async fn close_quietly(peer_id: &str, transport: &dyn TransportSession) {
    if let Err(e) = transport.close().await {
        debug!(event = "transport_close_failure", peer = %peer_id, error = %e);
    }
}

impl SessionNegotiator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signal: Arc<dyn SignalSink>,
        router: Arc<DataStreamRouter>,
        events: EventBus<PeerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                signal,
                router,
                events,
                sessions: Mutex::new(HashMap::new()),
                client_id: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<PeerEvent> {
        &self.inner.events
    }

    /// Our id as assigned by the relay; outbound offers, answers and
    /// candidates are tagged with it.
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.inner.client_id.lock() = Some(client_id.into());
    }

    fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().clone()
    }

    /// Peers whose session is currently connected. Evaluated on each call.
    pub async fn get_connected_peers(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().await;
        let mut peers: Vec<String> = sessions
            .values()
            .filter(|s| s.state.is_connected())
            .map(|s| s.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub async fn session_state(&self, peer_id: &str) -> Option<SessionState> {
        self.inner.sessions.lock().await.get(peer_id).map(|s| s.state)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Start negotiating with `peer_id` as the offering side.
    ///
    /// Fails if a session for the peer already exists. On any failure the
    /// half-built session is closed and nothing is registered.
    pub async fn connect(&self, peer_id: &str) -> Result<(), NegotiationError> {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(peer_id) {
            warn!(event = "connect_session_exists", peer = %peer_id);
            return Err(NegotiationError::SessionExists(peer_id.to_string()));
        }
        let client_id = self.client_id().ok_or(NegotiationError::NoClientId)?;

        info!(event = "negotiation_start", peer = %peer_id, role = "offerer");
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.inner.factory.create(tx).await.map_err(|e| {
            error!(event = "transport_create_failure", peer = %peer_id, error = %e);
            NegotiationError::from(e)
        })?;

        let mut session = PeerSession::new(peer_id, transport.clone());
        let offer = match Self::prepare_offer(&mut session).await {
            Ok(offer) => offer,
            Err(e) => {
                error!(event = "offer_failure", peer = %peer_id, error = %e);
                close_quietly(peer_id, &*transport).await;
                return Err(e.into());
            }
        };

        let session_id = session.session_id;
        sessions.insert(peer_id.to_string(), session);
        drop(sessions);

        self.spawn_pump(peer_id, session_id, rx);
        self.inner.signal.signal(ClientMessage::Offer {
            peer_id: client_id,
            offer,
        });
        Ok(())
    }

    async fn prepare_offer(session: &mut PeerSession) -> anyhow::Result<SessionDescription> {
        let stream = session.transport.open_data_stream(DATA_STREAM_LABEL).await?;
        session.stream = Some(stream);
        let offer = session.transport.create_offer().await?;
        session.advance(SessionInput::OfferSent);
        Ok(offer)
    }

    /// Answer a remote offer. Any existing session for the peer is replaced
    /// and its transport closed. Failures are logged.
    pub async fn handle_offer(&self, peer_id: &str, offer: SessionDescription) {
        let Some(client_id) = self.client_id() else {
            warn!(event = "offer_without_client_id", peer = %peer_id);
            return;
        };
        let mut sessions = self.inner.sessions.lock().await;

        if let Some(old) = sessions.remove(peer_id) {
            warn!(
                event = "session_replaced",
                peer = %peer_id,
                old_session = %old.session_id,
                "Offer for a peer with a live session; replacing it"
            );
            self.inner.router.detach_stream(peer_id);
            close_quietly(peer_id, &*old.transport).await;
            if old.state.is_connected() {
                self.inner
                    .events
                    .emit(PeerEvent::PeerDisconnected(peer_id.to_string()));
            }
        }

        info!(event = "negotiation_start", peer = %peer_id, role = "answerer");
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = match self.inner.factory.create(tx).await {
            Ok(t) => t,
            Err(e) => {
                error!(event = "transport_create_failure", peer = %peer_id, error = %e);
                return;
            }
        };

        let mut session = PeerSession::new(peer_id, transport.clone());
        session.advance(SessionInput::OfferReceived);
        let answer = match Self::prepare_answer(&mut session, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(event = "answer_failure", peer = %peer_id, error = %e);
                close_quietly(peer_id, &*transport).await;
                return;
            }
        };

        let session_id = session.session_id;
        sessions.insert(peer_id.to_string(), session);
        drop(sessions);

        self.spawn_pump(peer_id, session_id, rx);
        self.inner.signal.signal(ClientMessage::Answer {
            peer_id: client_id,
            answer,
        });
    }

    async fn prepare_answer(
        session: &mut PeerSession,
        offer: SessionDescription,
    ) -> anyhow::Result<SessionDescription> {
        session.transport.set_remote_description(offer).await?;
        session.remote_description_set = true;
        let answer = session.transport.create_answer().await?;
        session.advance(SessionInput::AnswerSent);
        Ok(answer)
    }

    /// Apply the remote answer to our pending offer. No-op for unknown peers.
    pub async fn handle_answer(&self, peer_id: &str, answer: SessionDescription) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(peer_id) else {
            debug!(event = "answer_unknown_peer", peer = %peer_id);
            return;
        };
        if session.state.apply(SessionInput::AnswerApplied).is_none() {
            warn!(event = "answer_unexpected", peer = %peer_id, state = ?session.state);
            return;
        }
        if let Err(e) = session.transport.set_remote_description(answer).await {
            error!(event = "answer_apply_failure", peer = %peer_id, error = %e);
            return;
        }
        session.remote_description_set = true;
        session.advance(SessionInput::AnswerApplied);
        debug!(event = "answer_applied", peer = %peer_id);
        Self::flush_candidates(session).await;
    }

    /// Apply a trickled remote candidate, or queue it until the remote
    /// description is in place. No-op for unknown peers.
    pub async fn handle_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(peer_id) else {
            debug!(event = "candidate_unknown_peer", peer = %peer_id);
            return;
        };
        if !session.remote_description_set {
            debug!(event = "candidate_queued", peer = %peer_id);
            session.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = session.transport.add_ice_candidate(candidate).await {
            warn!(event = "candidate_apply_failure", peer = %peer_id, error = %e);
        }
    }

    async fn flush_candidates(session: &mut PeerSession) {
        for c in std::mem::take(&mut session.pending_candidates) {
            if let Err(e) = session.transport.add_ice_candidate(c).await {
                warn!(event = "candidate_apply_failure", peer = %session.peer_id, error = %e);
            }
        }
    }

    /// Close and forget the peer's session.
    pub async fn disconnect(&self, peer_id: &str) {
        let Some(session) = self.inner.sessions.lock().await.remove(peer_id) else {
            return;
        };
        info!(event = "peer_disconnect", peer = %peer_id);
        close_quietly(peer_id, &*session.transport).await;
        self.inner.router.detach_stream(peer_id);
        self.inner
            .events
            .emit(PeerEvent::PeerDisconnected(peer_id.to_string()));
    }

    fn spawn_pump(&self, peer_id: &str, session_id: Uuid, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if !this.on_transport_event(&peer_id, session_id, ev).await {
                    break;
                }
            }
            debug!(event = "transport_pump_stopped", peer = %peer_id, session = %session_id);
        });
    }

    /// Returns `false` once the session is gone.
    async fn on_transport_event(&self, peer_id: &str, session_id: Uuid, ev: TransportEvent) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions
            .get_mut(peer_id)
            .filter(|s| s.session_id == session_id)
        else {
            debug!(event = "stale_transport_event", peer = %peer_id, ?ev);
            return false;
        };

        match ev {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(client_id) = self.client_id() {
                    self.inner.signal.signal(ClientMessage::Candidate {
                        peer_id: client_id,
                        candidate,
                    });
                }
            }
            TransportEvent::StateChanged(state) => {
                match session.advance(SessionInput::Transport(state)) {
                    Some(SessionState::Connected) => {
                        info!(event = "peer_connected", peer = %peer_id);
                        self.inner
                            .events
                            .emit(PeerEvent::PeerConnected(peer_id.to_string()));
                    }
                    Some(SessionState::Disconnected) => {
                        info!(event = "peer_lost", peer = %peer_id, ?state);
                        let Some(session) = sessions.remove(peer_id) else {
                            return false;
                        };
                        drop(sessions);
                        close_quietly(peer_id, &*session.transport).await;
                        self.inner.router.detach_stream(peer_id);
                        self.inner
                            .events
                            .emit(PeerEvent::PeerDisconnected(peer_id.to_string()));
                        return false;
                    }
                    _ => {}
                }
            }
            TransportEvent::RemoteStream(stream) => {
                if stream.label() != DATA_STREAM_LABEL {
                    debug!(event = "unexpected_stream", peer = %peer_id, label = %stream.label());
                    return true;
                }
                let already_open = stream.is_open();
                session.stream = Some(stream);
                if already_open {
                    self.stream_opened(session);
                }
            }
            TransportEvent::StreamOpen { label } => {
                if label == DATA_STREAM_LABEL {
                    self.stream_opened(session);
                }
            }
            TransportEvent::StreamClosed { label } => {
                if label != DATA_STREAM_LABEL {
                    return true;
                }
                if let Some(next) = session.stream_state.close() {
                    session.stream_state = next;
                    self.inner.router.detach_stream(peer_id);
                    info!(event = "data_stream_closed", peer = %peer_id);
                    self.inner
                        .events
                        .emit(PeerEvent::DataStreamClose(peer_id.to_string()));
                }
            }
            TransportEvent::StreamMessage { label, data } => {
                if label == DATA_STREAM_LABEL {
                    self.inner.router.route_inbound(peer_id, data);
                }
            }
        }
        true
    }

    fn stream_opened(&self, session: &mut PeerSession) {
        let Some(stream) = session.stream.clone() else {
            return;
        };
        let Some(next) = session.stream_state.open() else {
            return;
        };
        session.stream_state = next;
        self.inner.router.attach_stream(&session.peer_id, stream);
        info!(event = "data_stream_open", peer = %session.peer_id);
        self.inner
            .events
            .emit(PeerEvent::DataStreamOpen(session.peer_id.clone()));
    }

    /// Disconnect every session.
    pub async fn disconnect_all(&self) {
        let peers: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        for peer in peers {
            self.disconnect(&peer).await;
        }
    }
}
