//! In-process signaling relay.
//!
//! Stands in for the WebSocket signaling server a deployment would use:
//! each named peer gets a mailbox, and messages cross it as JSON text, the
//! same way they would cross a real relay.

use crate::core::connection::{SignalingMessage, SignalingRelay};
use crate::core::error::{Result, TransferError};
use crate::core::session::Session;
use crate::utils::sos::SignalOfStop;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One message in flight: sender name plus the JSON-encoded payload.
#[derive(Debug, Clone)]
struct Envelope {
    from: String,
    text: String,
}

/// Hub of named mailboxes.
#[derive(Clone, Default)]
pub struct LocalRelay {
    mailboxes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` and return its sending and receiving halves.
    /// Registering a name again replaces its previous mailbox.
    pub async fn join(&self, name: &str) -> (RelayEndpoint, RelayInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.insert(name.to_string(), tx);
        (
            RelayEndpoint {
                name: name.to_string(),
                relay: self.clone(),
            },
            RelayInbox { rx },
        )
    }

    pub async fn leave(&self, name: &str) {
        self.mailboxes.write().await.remove(name);
    }
}

/// Sending half bound to one peer name.
pub struct RelayEndpoint {
    name: String,
    relay: LocalRelay,
}

impl RelayEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl SignalingRelay for RelayEndpoint {
    async fn send(&self, to: &str, msg: SignalingMessage) -> Result<()> {
        let text = msg
            .to_json()
            .map_err(|e| TransferError::Transport(format!("encoding signal: {e}")))?;
        let mailboxes = self.relay.mailboxes.read().await;
        let tx = mailboxes
            .get(to)
            .ok_or_else(|| TransferError::UnknownPeer(to.to_string()))?;
        debug!(
            event = "relay_send",
            from = %self.name,
            to = %to,
            bytes = text.len(),
            "Relaying signal"
        );
        tx.send(Envelope {
            from: self.name.clone(),
            text,
        })
        .map_err(|_| TransferError::Transport(format!("relay mailbox of {to} is closed")))
    }
}

/// Receiving half of a mailbox.
pub struct RelayInbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl RelayInbox {
    /// Next well-formed message and its sender. Malformed payloads are
    /// logged and skipped; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<(String, SignalingMessage)> {
        loop {
            let Envelope { from, text } = self.rx.recv().await?;
            match SignalingMessage::from_json(&text) {
                Ok(msg) => return Some((from, msg)),
                Err(e) => warn!(
                    event = "relay_malformed",
                    from = %from,
                    error = %e,
                    "Dropping malformed signaling message"
                ),
            }
        }
    }
}

/// Feed everything arriving in `inbox` into `session` until `stop` fires.
///
/// The session was built with the matching [`RelayEndpoint`], so replies
/// (answers, local candidates) go back through the relay on their own.
pub fn spawn_pump(session: Session, mut inbox: RelayInbox, stop: SignalOfStop) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Some((from, msg))) = stop.select(inbox.recv()).await {
            if let Err(e) = session.handle_signal(&from, msg).await {
                warn!(
                    event = "signal_rejected",
                    from = %from,
                    error = %e,
                    "Failed to apply signaling message"
                );
            }
        }
        debug!(event = "relay_pump_stop");
    })
}
