//! Error taxonomy for the transfer core.
//!
//! Every fallible operation in `core` returns [`TransferError`]. Connection
//! loss is *not* an error: it surfaces as a state transition on the event
//! surface. Only the demo binary wraps these into `anyhow`.

use thiserror::Error;

/// Errors produced by signaling, the transfer protocol, and transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// A send was attempted with no open data channel to the target peer.
    #[error("no open data channel to peer {0}")]
    NoConnection(String),

    /// A signaling call referenced a peer that is not registered.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// A signaling call was made while the connection was in the wrong state.
    #[error("peer {peer_id}: invalid state: {reason}")]
    InvalidState { peer_id: String, reason: String },

    /// An inbound message broke the chunked transfer protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The underlying transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading the outgoing file failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// The supplied configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransferError {
    pub(crate) fn invalid_state(peer_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        Self::ProtocolViolation(format!("malformed control message: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = TransferError::invalid_state("bob", "not awaiting an answer");
        assert_eq!(e.to_string(), "peer bob: invalid state: not awaiting an answer");
        assert_eq!(
            TransferError::NoConnection("bob".into()).to_string(),
            "no open data channel to peer bob"
        );
    }

    #[test]
    fn test_json_error_is_violation() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            TransferError::from(err),
            TransferError::ProtocolViolation(_)
        ));
    }
}
