//! Transport seam: the negotiated peer session and the ordered, reliable data
//! stream it carries.
//!
//! Negotiation and transfer logic only see these traits. The production
//! implementation lives in [`webrtc`]; tests use the in-memory doubles in
//! `memory`.

pub mod types;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod memory;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use types::{IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportState};

/// Ordered, reliable, message-oriented stream carried over a transport session.
#[async_trait]
pub trait DataStream: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    /// Queue one message. Resolves once the message is handed to the
    /// transport buffer, not when it is delivered.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Bytes queued but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Resolves on the next buffered-amount-low notification. A notification
    /// that fired while nobody was waiting is retained once.
    async fn buffered_amount_low(&self);

    async fn close(&self) -> Result<()>;
}

/// One negotiated connection to a remote peer.
///
/// Asynchronous happenings (local candidates, state changes, stream
/// open/close/message) are reported on the event channel handed to
/// [`TransportFactory::create`].
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open a locally initiated data stream.
    async fn open_data_stream(&self, label: &str) -> Result<Arc<dyn DataStream>>;

    /// Generate an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates transport sessions. Owns the address-discovery configuration.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>>;
}
