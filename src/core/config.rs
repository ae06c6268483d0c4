//! Centralized configuration constants for Dropline.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Frame type bytes stay in the transfer codec.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Payload bytes carried by one chunk frame (64 KiB). The final chunk of a
/// file is shorter.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Transfer frame header: 1 byte frame type + 4 byte little-endian file id.
pub const HEADER_SIZE: usize = 5;

/// Low-buffer threshold installed on the data stream before a transfer.
///
/// The sender pulls the next slice immediately while the stream's buffered
/// amount is at or below this value, otherwise it waits for the stream's
/// buffered-amount-low notification.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 512 * 1024;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single multiplexed data stream opened per peer session.
pub const DATA_STREAM_LABEL: &str = "file-transfer";

/// Sub-protocol advertised on the data stream.
pub const DATA_STREAM_PROTOCOL: &str = "raw-binary";

/// Address-discovery endpoint used when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// How long the CLI waits for a peer data stream before giving up.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

// ── Rendezvous ───────────────────────────────────────────────────────────────

/// Default rendezvous relay used by the CLI.
pub const DEFAULT_RENDEZVOUS_URL: &str = "ws://127.0.0.1:8080/ws";

/// Maximum accepted rendezvous text frame. Session descriptions with many
/// candidates stay well below this.
pub const MAX_RENDEZVOUS_MESSAGE: usize = 256 * 1024;

// ── Engine configuration ─────────────────────────────────────────────────────

/// Configuration consumed by the engine at construction.
///
/// The discovery list is passed untouched to the transport-session factory;
/// core logic never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ordered address-discovery endpoints (`stun:` / `turn:` URLs).
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

fn default_ice_servers() -> Vec<String> {
    vec![DEFAULT_ICE_SERVER.to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

impl EngineConfig {
    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        if ice_servers.is_empty() {
            return Self::default();
        }
        Self { ice_servers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_list_falls_back_to_default() {
        let cfg = EngineConfig::with_ice_servers(Vec::new());
        assert_eq!(cfg.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
    }

    #[test]
    fn explicit_servers_keep_their_order() {
        let servers = vec!["stun:a.example:3478".to_string(), "turn:b.example:3478".to_string()];
        let cfg = EngineConfig::with_ice_servers(servers.clone());
        assert_eq!(cfg.ice_servers, servers);
    }

    #[test]
    fn missing_field_deserializes_to_default() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }
}
