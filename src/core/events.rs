//! Event surface: everything the application observes about the session.

use crate::core::connection::{ConnectionState, IceCandidate};
use crate::core::progress::Direction;
use crate::core::protocol::ReceivedFile;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    // ── Connection ────────────────────────────────────────────────────────────
    PeerStateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// A local ICE candidate the application must relay to `peer_id`.
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    ChannelOpened {
        peer_id: String,
    },
    ChannelClosed {
        peer_id: String,
    },

    // ── Transfers ─────────────────────────────────────────────────────────────
    /// A peer announced a file with `file-info`.
    IncomingFile {
        peer_id: String,
        file_id: String,
        file_name: String,
        file_size: u64,
    },
    Progress {
        direction: Direction,
        peer_id: String,
        file_id: String,
        percent: f64,
    },
    FileReceived {
        peer_id: String,
        file: ReceivedFile,
    },
    FileSent {
        peer_id: String,
        file_id: String,
        file_name: String,
    },
    TransferAborted {
        direction: Direction,
        peer_id: String,
        file_id: String,
        reason: String,
    },

    /// Channel errors and dropped protocol messages.
    Error {
        peer_id: String,
        message: String,
    },
}

/// Cloneable sending half of the application event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event; dropped once the application stopped listening.
    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }
}
