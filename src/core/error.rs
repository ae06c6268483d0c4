//! Error taxonomy shared by the rendezvous, negotiation and transfer layers.
//!
//! Only `connect()` on the negotiator returns an error to its caller; every
//! other failure is surfaced as an event or logged and dropped.

use thiserror::Error;

/// Rendezvous channel failures. Always delivered as an event, never returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("not connected to the rendezvous relay")]
    NotConnected,
    #[error("malformed rendezvous message: {0}")]
    Parse(String),
    #[error("relay reported an error: {0}")]
    Relay(String),
    #[error("rendezvous transport failure: {0}")]
    Transport(String),
}

/// Offer / answer / candidate failures.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("a session for peer {0} already exists")]
    SessionExists(String),
    #[error("no session for peer {0}")]
    UnknownPeer(String),
    #[error("no local client id assigned yet")]
    NoClientId,
    #[error("transport session error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Failures of an individual file transfer. Delivered as an error event and
/// always release the sender's single-flight slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("a transfer is already in progress")]
    Busy,
    #[error("File transfer cancelled.")]
    Cancelled,
    #[error("remote reported transfer status {0:?}")]
    RemoteFailed(String),
    #[error("no open data stream for peer {0}")]
    StreamClosed(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Malformed or out-of-order frames. Logged and dropped; never fails the
/// transfer they arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("frame of {0} bytes is shorter than the header")]
    ShortFrame(usize),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("chunk for unknown file id {0}")]
    UnknownFile(u32),
    #[error("metadata body is not valid: {0}")]
    BadMetadata(String),
    #[error("chunk for file id {file_id} runs past the declared {declared} bytes")]
    SizeExceeded { file_id: u32, declared: u64 },
}
