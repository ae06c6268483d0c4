//! Rendezvous: bootstraps a direct session by relaying small JSON control
//! messages through a shared room before any peer connection exists.

pub mod client;
pub mod protocol;

#[cfg(test)]
pub(crate) mod memory;

pub use client::{
    Dialer, LinkEvent, RendezvousClient, RendezvousEvent, RendezvousLink, RendezvousState, Role,
    WebSocketDialer,
};
pub use protocol::{ClientMessage, RelayMessage};

/// Outbound half of the rendezvous channel as seen by session negotiation.
pub trait SignalSink: Send + Sync {
    fn signal(&self, msg: ClientMessage);
}

impl SignalSink for RendezvousClient {
    fn signal(&self, msg: ClientMessage) {
        self.send(msg);
    }
}
