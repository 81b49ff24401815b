//! Centralized configuration for the transfer core.
//!
//! Fixed protocol constants live here as `const`s so they can be reviewed in
//! one place. [`TransferConfig`] carries the values a deployment may want to
//! change; every field has a default matching the constants below, so an
//! empty TOML table is a valid configuration.

use crate::core::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// 16 KiB is the largest message size every browser data-channel
/// implementation accepts without fragmentation trouble.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size accepted in configuration (64 KiB SCTP default).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// The sender yields to the scheduler every this many chunks.
pub const YIELD_EVERY_CHUNKS: u32 = 10;

/// Length of the cooperative yield.
pub const YIELD_DELAY: Duration = Duration::from_millis(1);

/// Largest file a peer may announce via `file-info`.
///
/// Incoming files are reassembled in memory, so this bounds what a peer can
/// make us allocate.
pub const MAX_INCOMING_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// ── Data channel ─────────────────────────────────────────────────────────────

/// Label of the single file-transfer data channel per peer pair.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// High watermark for the channel's outbound buffer (bytes).
///
/// When `buffered_amount` plus the next message exceeds this value the
/// sender waits for the buffer to drain.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Longest the sender waits for the outbound buffer to drain.
pub const BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the outbound buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── ICE ──────────────────────────────────────────────────────────────────────

/// Public STUN endpoints used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Identifier used in progress keys for transfers we send.
pub const LOCAL_PEER: &str = "local";

// ── Runtime configuration ────────────────────────────────────────────────────

/// How chunk payloads are framed on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON `file-chunk` envelope followed by the raw bytes as a separate
    /// binary message. Compatible with browser peers.
    #[default]
    Split,
    /// One self-delimiting binary frame per chunk.
    Framed,
}

impl std::str::FromStr for WireFormat {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "split" => Ok(Self::Split),
            "framed" => Ok(Self::Framed),
            other => Err(TransferError::Config(format!(
                "unknown wire format {other:?}, expected split or framed"
            ))),
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split => f.write_str("split"),
            Self::Framed => f.write_str("framed"),
        }
    }
}

/// A STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            ..Default::default()
        }
    }
}

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    /// The protocol relies on in-order delivery; must stay `true`.
    pub ordered: bool,
    pub chunk_size: usize,
    pub yield_every: u32,
    pub yield_delay_ms: u64,
    pub wire_format: WireFormat,
    pub buffered_amount_high: usize,
    pub max_incoming_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|u| IceServer::stun(u)).collect(),
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
            chunk_size: CHUNK_SIZE,
            yield_every: YIELD_EVERY_CHUNKS,
            yield_delay_ms: YIELD_DELAY.as_millis() as u64,
            wire_format: WireFormat::Split,
            buffered_amount_high: DC_BUFFERED_AMOUNT_HIGH,
            max_incoming_file_size: MAX_INCOMING_FILE_SIZE,
        }
    }
}

impl TransferConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.ordered {
            return Err(TransferError::Config(
                "data channel must be ordered: chunk payloads follow their envelopes".into(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.channel_label.is_empty() {
            return Err(TransferError::Config("channel_label must not be empty".into()));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(TransferError::Config("ICE server entry without urls".into()));
        }
        Ok(())
    }

    pub fn yield_delay(&self) -> Duration {
        Duration::from_millis(self.yield_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransferConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.wire_format, WireFormat::Split);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(TransferConfig::from_toml("").unwrap(), TransferConfig::default());
    }

    #[test]
    fn test_toml_overrides() {
        let config = TransferConfig::from_toml(
            r#"
            chunk_size = 8192
            wire_format = "framed"

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "user"
            credential = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.wire_format, WireFormat::Framed);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "user");
        assert_eq!(config.channel_label, DATA_CHANNEL_LABEL);
    }

    #[test]
    fn test_wire_format_from_str() {
        assert_eq!("framed".parse::<WireFormat>().unwrap(), WireFormat::Framed);
        assert_eq!(WireFormat::Split.to_string(), "split");
        assert!("json".parse::<WireFormat>().is_err());
    }

    #[test]
    fn test_rejects_unordered_and_bad_chunk_size() {
        assert!(TransferConfig::from_toml("ordered = false").is_err());
        assert!(TransferConfig::from_toml("chunk_size = 0").is_err());
        assert!(TransferConfig::from_toml("chunk_size = 1048576").is_err());
    }
}
