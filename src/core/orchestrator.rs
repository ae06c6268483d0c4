//! Orchestrator: wires rendezvous, negotiation and transfer together and
//! exposes the facade used by front ends.
//!
//! Two pump tasks connect the layers. The rendezvous pump answers relay
//! messages (join on connect, negotiate on ready, apply offers, answers and
//! candidates, close on bye). The peer pump stops a peer's sender when its
//! data stream or session goes away. Both pumps process events in arrival
//! order, one at a time.

use crate::core::config::EngineConfig;
use crate::core::error::TransferError;
use crate::core::events::{EventBus, Subscription};
use crate::core::rendezvous::{
    ClientMessage, Dialer, RendezvousClient, RendezvousEvent, RendezvousState, WebSocketDialer,
};
use crate::core::session::{PeerEvent, SessionNegotiator};
use crate::core::transfer::{
    ChunkReceiver, ChunkSender, DataStreamRouter, OutgoingFile, ReceiverEvent, SenderEvent,
};
use crate::core::transport::webrtc::WebRtcTransportFactory;
use crate::core::transport::TransportFactory;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct Orchestrator {
    rendezvous: RendezvousClient,
    negotiator: SessionNegotiator,
    router: Arc<DataStreamRouter>,
    peer_events: EventBus<PeerEvent>,
    sender_events: EventBus<SenderEvent>,
    receiver_events: EventBus<ReceiverEvent>,
    room: Arc<Mutex<Option<String>>>,
}

impl Orchestrator {
    /// Production wiring: WebSocket relay at `rendezvous_url`, webrtc-rs
    /// sessions using the configured discovery endpoints.
    pub fn connect_websocket(rendezvous_url: &str, config: &EngineConfig) -> Result<Self> {
        let factory = WebRtcTransportFactory::new(config)?;
        Ok(Self::new(
            Arc::new(WebSocketDialer::new(rendezvous_url)),
            Arc::new(factory),
        ))
    }

    /// Must be called inside a tokio runtime; spawns the pump tasks.
    pub fn new(dialer: Arc<dyn Dialer>, factory: Arc<dyn TransportFactory>) -> Self {
        let rendezvous = RendezvousClient::new(dialer, EventBus::new());
        let sender_events = EventBus::new();
        let receiver_events = EventBus::new();
        let peer_events = EventBus::new();

        let router = Arc::new(DataStreamRouter::new(
            sender_events.clone(),
            receiver_events.clone(),
        ));
        let negotiator = SessionNegotiator::new(
            factory,
            Arc::new(rendezvous.clone()),
            router.clone(),
            peer_events.clone(),
        );

        let this = Self {
            rendezvous,
            negotiator,
            router,
            peer_events,
            sender_events,
            receiver_events,
            room: Arc::new(Mutex::new(None)),
        };

        let rendezvous_rx = this.rendezvous.subscribe();
        let peer_rx = this.peer_events.subscribe();
        tokio::spawn(this.clone().rendezvous_pump(rendezvous_rx));
        tokio::spawn(this.clone().peer_pump(peer_rx));
        this
    }

    // ── Event streams ─────────────────────────────────────────────────────────

    pub fn rendezvous_events(&self) -> Subscription<RendezvousEvent> {
        self.rendezvous.subscribe()
    }

    pub fn peer_events(&self) -> Subscription<PeerEvent> {
        self.peer_events.subscribe()
    }

    pub fn sender_events(&self) -> Subscription<SenderEvent> {
        self.sender_events.subscribe()
    }

    pub fn receiver_events(&self) -> Subscription<ReceiverEvent> {
        self.receiver_events.subscribe()
    }

    // ── Facade ────────────────────────────────────────────────────────────────

    /// Connect to the relay and join `room`, or ask for a new room with
    /// `None`. The join is sent once the relay connection is up.
    pub async fn connect(&self, room: Option<String>) {
        *self.room.lock() = room;
        self.rendezvous.connect().await;
    }

    /// Tell the other party we are ready to negotiate.
    pub fn ready(&self) {
        self.rendezvous.send(ClientMessage::Ready {
            peer_id: self.rendezvous.client_id(),
        });
    }

    pub async fn send_file(&self, peer_id: &str, file: OutgoingFile) -> Result<(), TransferError> {
        let name = file.metadata.name.clone();
        let result = self.router.send_file(peer_id, file).await;
        if let Err(e) = &result {
            warn!(event = "send_file_failure", peer = %peer_id, %name, error = %e);
        }
        result
    }

    /// Pause every active outbound transfer.
    pub fn pause(&self) {
        for sender in self.router.senders() {
            sender.pause();
        }
    }

    pub fn resume(&self) {
        for sender in self.router.senders() {
            sender.resume();
        }
    }

    pub async fn get_connected_peers(&self) -> Vec<String> {
        self.negotiator.get_connected_peers().await
    }

    /// Resolves once everything written to the peer's stream has left the
    /// send buffer, or the stream is gone.
    pub async fn drained(&self, peer_id: &str) {
        while let Some(stream) = self.router.stream(peer_id) {
            if !stream.is_open() || stream.buffered_amount().await == 0 {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub fn sender(&self, peer_id: &str) -> Option<Arc<ChunkSender>> {
        self.router.sender(peer_id)
    }

    pub fn receiver(&self, peer_id: &str) -> Option<Arc<ChunkReceiver>> {
        self.router.receiver(peer_id)
    }

    pub fn rendezvous_state(&self) -> RendezvousState {
        self.rendezvous.state()
    }

    /// Say `bye` on the relay and close it. Peer sessions stay up.
    pub fn close_rendezvous(&self) {
        self.rendezvous.disconnect();
    }

    /// Tear everything down: drop all subscribers, close every peer
    /// session and the relay connection.
    pub async fn disconnect(&self) {
        self.rendezvous.events().clear();
        self.peer_events.clear();
        self.sender_events.clear();
        self.receiver_events.clear();

        let sessions = self.negotiator.session_count().await;
        self.negotiator.disconnect_all().await;
        self.router.remove_all();
        self.rendezvous.close();
        info!(event = "orchestrator_disconnected", sessions);
    }

    // ── Pumps ─────────────────────────────────────────────────────────────────

    async fn rendezvous_pump(self, mut rx: Subscription<RendezvousEvent>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                RendezvousEvent::Connected => {
                    let room_id = self.room.lock().clone();
                    self.rendezvous.send(ClientMessage::Join { room_id });
                }
                RendezvousEvent::Created { client_id } | RendezvousEvent::Joined { client_id, .. } => {
                    self.negotiator.set_client_id(client_id);
                }
                RendezvousEvent::Ready { peer_id: Some(peer_id) } => {
                    if let Err(e) = self.negotiator.connect(&peer_id).await {
                        warn!(event = "negotiation_failure", peer = %peer_id, error = %e);
                    }
                }
                RendezvousEvent::Ready { peer_id: None } => {
                    warn!(event = "ready_without_peer", "Ready received but no peer is known");
                }
                RendezvousEvent::Offer { peer_id, offer } => {
                    self.negotiator.handle_offer(&peer_id, offer).await;
                }
                RendezvousEvent::Answer { peer_id, answer } => {
                    self.negotiator.handle_answer(&peer_id, answer).await;
                }
                RendezvousEvent::Candidate { peer_id, candidate } => {
                    self.negotiator.handle_candidate(&peer_id, candidate).await;
                }
                RendezvousEvent::Bye => self.rendezvous.close(),
                RendezvousEvent::Disconnected | RendezvousEvent::Error(_) => {}
            }
        }
        debug!(event = "rendezvous_pump_stopped");
    }

    async fn peer_pump(self, mut rx: Subscription<PeerEvent>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                PeerEvent::DataStreamClose(peer_id) => {
                    if let Some(sender) = self.router.sender(&peer_id) {
                        sender.stop();
                    }
                }
                PeerEvent::PeerDisconnected(peer_id) => self.router.remove_peer(&peer_id),
                PeerEvent::PeerConnected(_) | PeerEvent::DataStreamOpen(_) => {}
            }
        }
        debug!(event = "peer_pump_stopped");
    }
}
