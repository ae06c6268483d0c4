//! Dropline: peer-to-peer file transfer over WebRTC data channels.
//!
//! A rendezvous relay pairs two clients in a room; they then negotiate a
//! direct transport session and stream files over a single ordered data
//! stream with backpressure. [`core::orchestrator::Orchestrator`] is the
//! entry point.

pub mod core;
pub mod utils;
pub mod workers;
