//! Rendezvous client.
//!
//! Owns one relay connection at a time and translates its text frames into
//! [`RendezvousEvent`]s. There is no outbound queue: `send` before the
//! connection is up emits `NotConnected` and drops the message. There are no
//! timers and no reconnection; callers decide what to do on `Disconnected`.

use super::protocol::{ClientMessage, RelayMessage};
use crate::core::config::MAX_RENDEZVOUS_MESSAGE;
use crate::core::error::RendezvousError;
use crate::core::events::{EventBus, Subscription};
use crate::core::transport::{IceCandidate, SessionDescription};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ── Link ──────────────────────────────────────────────────────────────────────

/// What the underlying channel reports to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// Channel ended; `Some` carries the transport error that ended it.
    Closed(Option<String>),
}

/// An established relay channel bridged to in-process queues.
///
/// Dropping `outbound` closes the channel.
pub struct RendezvousLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens relay channels.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<RendezvousLink>;
}

/// Dials a WebSocket relay, text frames only.
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<RendezvousLink> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to rendezvous relay {}", self.url))?;
        info!(event = "rendezvous_socket_open", url = %self.url, "Rendezvous socket open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(event = "rendezvous_write_failure", error = %e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_RENDEZVOUS_MESSAGE {
                            warn!(event = "rendezvous_oversized", bytes = text.len());
                            continue;
                        }
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    // Ping/pong and binary frames carry nothing for us.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(RendezvousLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ── State / events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The room was empty when we joined.
    Creator,
    Joiner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Disconnected,
    Connecting,
    Connected,
    Joined(Role),
    Ready,
    Negotiating,
    Paired,
}

impl RendezvousState {
    fn is_joined(self) -> bool {
        matches!(
            self,
            Self::Joined(_) | Self::Ready | Self::Negotiating | Self::Paired
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    Connected,
    Disconnected,
    Created {
        client_id: String,
    },
    Joined {
        client_id: String,
        peer_id: Option<String>,
    },
    /// The remote party is ready to negotiate. `peer_id` falls back to the
    /// party named in our join reply when the message omits it.
    Ready {
        peer_id: Option<String>,
    },
    Offer {
        peer_id: String,
        offer: SessionDescription,
    },
    Answer {
        peer_id: String,
        answer: SessionDescription,
    },
    Candidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    Bye,
    Error(RendezvousError),
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Conn {
    state: RendezvousState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Bumped on every connect/close so a stale reader cannot touch state.
    generation: u64,
    client_id: Option<String>,
    peer_id: Option<String>,
}

struct Shared {
    conn: Mutex<Conn>,
    events: EventBus<RendezvousEvent>,
}

#[derive(Clone)]
pub struct RendezvousClient {
    dialer: Arc<dyn Dialer>,
    shared: Arc<Shared>,
}

impl RendezvousClient {
    pub fn new(dialer: Arc<dyn Dialer>, events: EventBus<RendezvousEvent>) -> Self {
        Self {
            dialer,
            shared: Arc::new(Shared {
                conn: Mutex::new(Conn {
                    state: RendezvousState::Disconnected,
                    outbound: None,
                    generation: 0,
                    client_id: None,
                    peer_id: None,
                }),
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventBus<RendezvousEvent> {
        &self.shared.events
    }

    pub fn subscribe(&self) -> Subscription<RendezvousEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> RendezvousState {
        self.shared.conn.lock().state
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared.conn.lock().client_id.clone()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.shared.conn.lock().peer_id.clone()
    }

    /// Open the relay connection. No-op while already connecting or open.
    /// Failures are reported as events, never returned.
    pub async fn connect(&self) {
        let generation = {
            let mut conn = self.shared.conn.lock();
            if conn.state != RendezvousState::Disconnected {
                debug!(event = "rendezvous_connect_noop", state = ?conn.state);
                return;
            }
            conn.state = RendezvousState::Connecting;
            conn.generation += 1;
            conn.generation
        };

        let link = match self.dialer.dial().await {
            Ok(link) => link,
            Err(e) => {
                warn!(event = "rendezvous_connect_failure", error = %e);
                {
                    let mut conn = self.shared.conn.lock();
                    if conn.generation == generation {
                        conn.state = RendezvousState::Disconnected;
                    }
                }
                self.shared
                    .events
                    .emit(RendezvousEvent::Error(RendezvousError::Transport(format!("{e:#}"))));
                return;
            }
        };

        {
            let mut conn = self.shared.conn.lock();
            if conn.generation != generation {
                // Closed while dialing.
                return;
            }
            conn.state = RendezvousState::Connected;
            conn.outbound = Some(link.outbound);
        }
        info!(event = "rendezvous_connected", "Connected to rendezvous relay");
        self.shared.events.emit(RendezvousEvent::Connected);

        let shared = self.shared.clone();
        tokio::spawn(read_loop(shared, generation, link.inbound));
    }

    /// Send one control message. Emits `NotConnected` and drops the message
    /// when no connection is open.
    pub fn send(&self, msg: ClientMessage) {
        let kind = msg.kind();
        let mut conn = self.shared.conn.lock();
        let Some(outbound) = conn.outbound.clone() else {
            drop(conn);
            warn!(event = "rendezvous_send_not_connected", kind);
            self.shared
                .events
                .emit(RendezvousEvent::Error(RendezvousError::NotConnected));
            return;
        };

        let text = match msg.encode() {
            Ok(t) => t,
            Err(e) => {
                drop(conn);
                self.shared.events.emit(RendezvousEvent::Error(e));
                return;
            }
        };

        if outbound.send(text).is_err() {
            drop(conn);
            warn!(event = "rendezvous_send_failure", kind);
            self.shared.events.emit(RendezvousEvent::Error(RendezvousError::Transport(
                "relay channel closed".into(),
            )));
            return;
        }
        debug!(event = "rendezvous_sent", kind);

        conn.state = match (&msg, conn.state) {
            (ClientMessage::Ready { .. }, RendezvousState::Joined(_)) => RendezvousState::Ready,
            (ClientMessage::Offer { .. } | ClientMessage::Answer { .. }, s) if s.is_joined() => {
                RendezvousState::Negotiating
            }
            (ClientMessage::Bye {}, RendezvousState::Negotiating) => RendezvousState::Paired,
            (_, s) => s,
        };
    }

    /// Send `bye`, then close the connection.
    pub fn disconnect(&self) {
        if self.shared.conn.lock().outbound.is_some() {
            self.send(ClientMessage::Bye {});
        }
        self.close();
    }

    /// Close without saying goodbye (the other side already did).
    pub fn close(&self) {
        let was_open = {
            let mut conn = self.shared.conn.lock();
            let was_open = conn.state != RendezvousState::Disconnected;
            conn.state = RendezvousState::Disconnected;
            conn.outbound = None;
            conn.generation += 1;
            was_open
        };
        if was_open {
            info!(event = "rendezvous_closed", "Rendezvous connection closed");
            self.shared.events.emit(RendezvousEvent::Disconnected);
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(ev) = inbound.recv().await {
        if shared.conn.lock().generation != generation {
            return;
        }
        match ev {
            LinkEvent::Text(text) => match RelayMessage::decode(&text) {
                Ok(Some(msg)) => handle_message(&shared, msg),
                Ok(None) => debug!(event = "rendezvous_unknown_type", "Ignoring unknown message type"),
                Err(e) => {
                    warn!(event = "rendezvous_parse_failure", error = %e);
                    shared.events.emit(RendezvousEvent::Error(e));
                }
            },
            LinkEvent::Closed(reason) => {
                {
                    let mut conn = shared.conn.lock();
                    conn.state = RendezvousState::Disconnected;
                    conn.outbound = None;
                    conn.generation += 1;
                }
                if let Some(reason) = reason {
                    warn!(event = "rendezvous_transport_error", %reason);
                    shared
                        .events
                        .emit(RendezvousEvent::Error(RendezvousError::Transport(reason)));
                }
                info!(event = "rendezvous_disconnected", "Rendezvous relay closed the connection");
                shared.events.emit(RendezvousEvent::Disconnected);
                return;
            }
        }
    }
}

fn handle_message(shared: &Shared, msg: RelayMessage) {
    let event = {
        let mut conn = shared.conn.lock();
        match msg {
            RelayMessage::Create { client_id } => {
                info!(event = "rendezvous_room_created", %client_id);
                conn.state = RendezvousState::Joined(Role::Creator);
                conn.client_id = Some(client_id.clone());
                RendezvousEvent::Created { client_id }
            }
            RelayMessage::Join { client_id, peer_id } => {
                info!(event = "rendezvous_room_joined", %client_id, peer = ?peer_id);
                conn.state = RendezvousState::Joined(Role::Joiner);
                conn.client_id = Some(client_id.clone());
                conn.peer_id = peer_id.clone();
                RendezvousEvent::Joined { client_id, peer_id }
            }
            RelayMessage::Ready { peer_id } => {
                if !conn.state.is_joined() {
                    warn!(event = "rendezvous_ready_before_join", state = ?conn.state, "Ignoring ready before joining a room");
                    return;
                }
                if peer_id.is_some() {
                    conn.peer_id = peer_id.clone();
                }
                conn.state = RendezvousState::Ready;
                RendezvousEvent::Ready {
                    peer_id: peer_id.or_else(|| conn.peer_id.clone()),
                }
            }
            RelayMessage::Offer { .. } | RelayMessage::Answer { .. } if !conn.state.is_joined() => {
                warn!(event = "rendezvous_sdp_before_join", state = ?conn.state, "Ignoring session description before joining a room");
                return;
            }
            RelayMessage::Offer { peer_id, offer } => {
                conn.state = RendezvousState::Negotiating;
                RendezvousEvent::Offer { peer_id, offer }
            }
            RelayMessage::Answer { peer_id, answer } => {
                conn.state = RendezvousState::Negotiating;
                RendezvousEvent::Answer { peer_id, answer }
            }
            RelayMessage::Candidate { peer_id, candidate } => {
                RendezvousEvent::Candidate { peer_id, candidate }
            }
            RelayMessage::Bye => {
                if conn.state == RendezvousState::Negotiating {
                    conn.state = RendezvousState::Paired;
                }
                RendezvousEvent::Bye
            }
            RelayMessage::Error { message } => {
                warn!(event = "rendezvous_relay_error", %message);
                RendezvousEvent::Error(RendezvousError::Relay(message))
            }
        }
    };
    shared.events.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rendezvous::memory::{memory_relay, next_event};
    use serde_json::json;

    fn client() -> (RendezvousClient, crate::core::rendezvous::memory::RelayEnd) {
        let (dialer, relay) = memory_relay();
        (RendezvousClient::new(Arc::new(dialer), EventBus::new()), relay)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (dialer, _relay) = memory_relay();
        let dialer = Arc::new(dialer);
        let c = RendezvousClient::new(dialer.clone(), EventBus::new());
        let mut rx = c.subscribe();

        c.connect().await;
        c.connect().await;

        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Connected);
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(c.state(), RendezvousState::Connected);
    }

    #[tokio::test]
    async fn send_before_connect_emits_not_connected() {
        let (c, _relay) = client();
        let mut rx = c.subscribe();

        c.send(ClientMessage::Ready { peer_id: None });

        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Error(RendezvousError::NotConnected)
        );
    }

    #[tokio::test]
    async fn dial_failure_is_an_event() {
        let (dialer, relay) = memory_relay();
        drop(relay);
        dialer.fail_next();
        let c = RendezvousClient::new(Arc::new(dialer), EventBus::new());
        let mut rx = c.subscribe();

        c.connect().await;

        assert!(matches!(
            next_event(&mut rx).await,
            RendezvousEvent::Error(RendezvousError::Transport(_))
        ));
        assert_eq!(c.state(), RendezvousState::Disconnected);
    }

    #[tokio::test]
    async fn create_then_ready_walks_the_state_machine() {
        let (c, mut relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Connected);

        c.send(ClientMessage::Join { room_id: None });
        assert_eq!(
            relay.next_message().await,
            Some(json!({"type": "join", "payload": {"room_id": null}}))
        );

        relay.push(json!({"type": "create", "payload": {"client_id": "me"}}));
        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Created { client_id: "me".into() }
        );
        assert_eq!(c.state(), RendezvousState::Joined(Role::Creator));
        assert_eq!(c.client_id().as_deref(), Some("me"));

        relay.push(json!({"type": "ready", "payload": {"peer_id": "them"}}));
        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Ready { peer_id: Some("them".into()) }
        );
        assert_eq!(c.state(), RendezvousState::Ready);

        c.send(ClientMessage::Offer {
            peer_id: "me".into(),
            offer: SessionDescription::offer("v=0"),
        });
        assert_eq!(c.state(), RendezvousState::Negotiating);
    }

    #[tokio::test]
    async fn ready_before_join_is_ignored() {
        let (c, relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Connected);

        relay.push(json!({"type": "ready", "payload": {"peer_id": "early"}}));
        relay.push(json!({"type": "join", "payload": {"client_id": "me", "peer_id": "them"}}));

        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Joined {
                client_id: "me".into(),
                peer_id: Some("them".into())
            }
        );
        assert_eq!(c.state(), RendezvousState::Joined(Role::Joiner));
    }

    #[tokio::test]
    async fn offer_before_join_is_ignored() {
        let (c, relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Connected);

        relay.push(json!({"type": "offer", "payload": {"peer_id": "them", "offer": {"type": "offer", "sdp": "v=0"}}}));
        relay.push(json!({"type": "answer", "payload": {"peer_id": "them", "answer": {"type": "answer", "sdp": "v=0"}}}));
        relay.push(json!({"type": "create", "payload": {"client_id": "me"}}));

        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Created { client_id: "me".into() }
        );
        assert_eq!(c.state(), RendezvousState::Joined(Role::Creator));
    }

    #[tokio::test]
    async fn ready_without_peer_falls_back_to_join_reply() {
        let (c, relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        let _ = next_event(&mut rx).await;

        relay.push(json!({"type": "join", "payload": {"client_id": "me", "peer_id": "them"}}));
        let _ = next_event(&mut rx).await;
        relay.push(json!({"type": "ready", "payload": {}}));

        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Ready { peer_id: Some("them".into()) }
        );
    }

    #[tokio::test]
    async fn malformed_and_relay_errors_are_events() {
        let (c, relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        let _ = next_event(&mut rx).await;

        relay.push_raw("{not json");
        assert!(matches!(
            next_event(&mut rx).await,
            RendezvousEvent::Error(RendezvousError::Parse(_))
        ));

        relay.push(json!({"type": "error", "payload": {"message": "room full"}}));
        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Error(RendezvousError::Relay("room full".into()))
        );
    }

    #[tokio::test]
    async fn disconnect_sends_bye_then_closes() {
        let (c, mut relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        let _ = next_event(&mut rx).await;

        c.disconnect();

        assert_eq!(
            relay.next_message().await,
            Some(json!({"type": "bye", "payload": {}}))
        );
        assert_eq!(relay.next_message().await, None);
        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Disconnected);
        assert_eq!(c.state(), RendezvousState::Disconnected);
    }

    #[tokio::test]
    async fn remote_close_reports_disconnect() {
        let (c, relay) = client();
        let mut rx = c.subscribe();
        c.connect().await;
        let _ = next_event(&mut rx).await;

        relay.close(Some("reset".into()));

        assert_eq!(
            next_event(&mut rx).await,
            RendezvousEvent::Error(RendezvousError::Transport("reset".into()))
        );
        assert_eq!(next_event(&mut rx).await, RendezvousEvent::Disconnected);
        assert_eq!(c.state(), RendezvousState::Disconnected);
    }
}
