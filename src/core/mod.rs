pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod rendezvous;
pub mod session;
pub mod transfer;
pub mod transport;
