//! Per-peer session negotiation.

pub mod negotiator;
pub mod state;

pub use negotiator::{PeerEvent, SessionNegotiator};
pub use state::{PeerSession, SessionInput, SessionState, StreamState};
