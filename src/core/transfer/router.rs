//! DataStreamRouter: per-peer routing between data streams and the
//! sender/receiver pair that owns each peer's transfers.

use super::file::OutgoingFile;
use super::receiver::{ChunkReceiver, ReceiverEvent};
use super::sender::{ChunkSender, SenderEvent};
use crate::core::error::TransferError;
use crate::core::events::EventBus;
use crate::core::transport::DataStream;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct PeerChannel {
    stream: Option<Arc<dyn DataStream>>,
    sender: Arc<ChunkSender>,
    receiver: Arc<ChunkReceiver>,
}

/// One sender/receiver pair per peer, all sharing the injected buses, so
/// transfers to different peers run independently.
pub struct DataStreamRouter {
    sender_events: EventBus<SenderEvent>,
    receiver_events: EventBus<ReceiverEvent>,
    peers: Mutex<HashMap<String, PeerChannel>>,
}

impl DataStreamRouter {
    pub fn new(sender_events: EventBus<SenderEvent>, receiver_events: EventBus<ReceiverEvent>) -> Self {
        Self {
            sender_events,
            receiver_events,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn with_channel<R>(&self, peer_id: &str, f: impl FnOnce(&mut PeerChannel) -> R) -> R {
        let mut peers = self.peers.lock();
        let channel = peers.entry(peer_id.to_string()).or_insert_with(|| PeerChannel {
            stream: None,
            sender: Arc::new(ChunkSender::new(self.sender_events.clone())),
            receiver: Arc::new(ChunkReceiver::new(self.receiver_events.clone())),
        });
        f(channel)
    }

    /// Make `stream` the peer's outbound stream.
    pub fn attach_stream(&self, peer_id: &str, stream: Arc<dyn DataStream>) {
        info!(event = "stream_attached", peer = %peer_id, label = %stream.label());
        self.with_channel(peer_id, |c| c.stream = Some(stream));
    }

    /// Forget the peer's stream. Returns whether one was attached.
    pub fn detach_stream(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.lock();
        let detached = peers
            .get_mut(peer_id)
            .and_then(|c| c.stream.take())
            .is_some();
        if detached {
            debug!(event = "stream_detached", peer = %peer_id);
        }
        detached
    }

    pub fn stream(&self, peer_id: &str) -> Option<Arc<dyn DataStream>> {
        self.peers.lock().get(peer_id).and_then(|c| c.stream.clone())
    }

    /// Inbound stream message → the peer's receiver.
    pub fn route_inbound(&self, peer_id: &str, message: Bytes) {
        let receiver = self.with_channel(peer_id, |c| c.receiver.clone());
        receiver.receive(peer_id, message);
    }

    /// Outbound request → the peer's sender over the peer's open stream.
    pub async fn send_file(&self, peer_id: &str, file: OutgoingFile) -> Result<(), TransferError> {
        let (stream, sender) = {
            let peers = self.peers.lock();
            let channel = peers.get(peer_id);
            (
                channel.and_then(|c| c.stream.clone()),
                channel.map(|c| c.sender.clone()),
            )
        };
        let (Some(stream), Some(sender)) = (stream, sender) else {
            warn!(event = "send_no_stream", peer = %peer_id, "No data stream for peer");
            return Err(TransferError::StreamClosed(peer_id.to_string()));
        };
        if !stream.is_open() {
            warn!(event = "send_stream_not_open", peer = %peer_id);
            return Err(TransferError::StreamClosed(peer_id.to_string()));
        }
        sender.send(&*stream, peer_id, file).await
    }

    pub fn sender(&self, peer_id: &str) -> Option<Arc<ChunkSender>> {
        self.peers.lock().get(peer_id).map(|c| c.sender.clone())
    }

    pub fn receiver(&self, peer_id: &str) -> Option<Arc<ChunkReceiver>> {
        self.peers.lock().get(peer_id).map(|c| c.receiver.clone())
    }

    pub fn senders(&self) -> Vec<Arc<ChunkSender>> {
        self.peers.lock().values().map(|c| c.sender.clone()).collect()
    }

    /// Stop the peer's transfer, drop partial receptions and forget the peer.
    pub fn remove_peer(&self, peer_id: &str) {
        let Some(channel) = self.peers.lock().remove(peer_id) else {
            return;
        };
        channel.sender.stop();
        channel.receiver.clear();
        info!(event = "router_peer_removed", peer = %peer_id);
    }

    /// [`remove_peer`](Self::remove_peer) for every known peer.
    pub fn remove_all(&self) {
        let peers: Vec<String> = self.peers.lock().keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer);
        }
    }
}
