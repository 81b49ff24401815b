//! Transfer Registry: peer id → live PeerConnection.
//!
//! The registry is the single point of truth for "is peer X connected /
//! transferring". Every transport event and inbound channel message is
//! dispatched through it; anything addressed to a peer that is not
//! registered, or to a connection generation that has been replaced, is
//! dropped here.
//!
//! Lock order is always registry, then progress table. Critical sections
//! never await a transport call.

use crate::core::connection::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, TransportAdapter,
};
use crate::core::protocol::InboundTransfers;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the offer and the data channel.
    Initiator,
    /// Answered an offer; receives the channel from the remote side.
    Responder,
}

/// Everything the core knows about one remote peer.
pub struct PeerConnection {
    pub peer_id: String,
    pub generation: u64,
    pub role: Role,
    pub state: ConnectionState,
    pub adapter: Arc<dyn TransportAdapter>,
    pub channel: Option<Arc<dyn DataChannel>>,
    pub channel_state: ChannelState,
    pub remote_description_set: bool,
    /// Remote candidates received before the remote description.
    pub candidate_queue: Vec<IceCandidate>,
    /// Local candidates held back until our description has been handed out.
    pub local_candidates: Vec<IceCandidate>,
    pub local_candidates_released: bool,
    pub inbound: InboundTransfers,
    /// Outgoing transfer ids, queued or in flight.
    pub outgoing: Vec<String>,
    /// Serializes description and candidate handling.
    pub signal_gate: Arc<Mutex<()>>,
    /// Serializes outgoing transfers (FIFO).
    pub send_gate: Arc<Mutex<()>>,
}

impl PeerConnection {
    pub fn new(
        peer_id: &str,
        generation: u64,
        role: Role,
        adapter: Arc<dyn TransportAdapter>,
        max_incoming_file_size: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            role,
            state: ConnectionState::New,
            adapter,
            channel: None,
            channel_state: ChannelState::Connecting,
            remote_description_set: false,
            candidate_queue: Vec::new(),
            local_candidates: Vec::new(),
            local_candidates_released: false,
            inbound: InboundTransfers::new(max_incoming_file_size),
            outgoing: Vec::new(),
            signal_gate: Arc::new(Mutex::new(())),
            send_gate: Arc::new(Mutex::new(())),
        }
    }

    /// The data channel, if it exists and is open.
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        match &self.channel {
            Some(dc) if self.channel_state == ChannelState::Open && dc.is_open() => {
                Some(dc.clone())
            }
            _ => None,
        }
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            role: self.role,
            state: self.state,
            channel_state: self.channel.as_ref().map(|_| self.channel_state),
            queued_candidates: self.candidate_queue.len(),
            incoming_transfers: self.inbound.len(),
            outgoing_transfers: self.outgoing.len(),
        }
    }
}

/// Read-only view of a [`PeerConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub role: Role,
    pub state: ConnectionState,
    /// `None` until the peer has a data channel.
    pub channel_state: Option<ChannelState>,
    pub queued_candidates: usize,
    pub incoming_transfers: usize,
    pub outgoing_transfers: usize,
}

type PeerMap = HashMap<String, PeerConnection>;

#[derive(Clone, Default)]
pub struct TransferRegistry {
    peers: Arc<RwLock<PeerMap>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`, returning the connection it replaced, if any.
    /// `on_replaced` sees the old connection while the write lock is held.
    pub async fn register(
        &self,
        conn: PeerConnection,
        on_replaced: impl FnOnce(&PeerConnection),
    ) -> Option<PeerConnection> {
        let mut peers = self.peers.write().await;
        let replaced = peers.insert(conn.peer_id.clone(), conn);
        if let Some(old) = &replaced {
            on_replaced(old);
        }
        replaced
    }

    /// Remove the entry; `on_removed` runs before the write lock is released.
    pub async fn unregister(
        &self,
        peer_id: &str,
        on_removed: impl FnOnce(&PeerConnection),
    ) -> Option<PeerConnection> {
        let removed = self.peers.write().await.remove(peer_id);
        if let Some(conn) = &removed {
            on_removed(conn);
        }
        removed
    }

    /// Remove the entry only if it still belongs to `generation`.
    pub async fn unregister_generation(
        &self,
        peer_id: &str,
        generation: u64,
        on_removed: impl FnOnce(&PeerConnection),
    ) -> Option<PeerConnection> {
        let mut peers = self.peers.write().await;
        let removed = match peers.get(peer_id) {
            Some(conn) if conn.generation == generation => peers.remove(peer_id),
            _ => None,
        };
        if let Some(conn) = &removed {
            on_removed(conn);
        }
        removed
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerSummary> {
        self.peers.read().await.get(peer_id).map(PeerConnection::summary)
    }

    /// Channel state of every peer that has a data channel.
    pub async fn channels_snapshot(&self) -> HashMap<String, ChannelState> {
        self.peers
            .read()
            .await
            .values()
            .filter(|c| c.channel.is_some())
            .map(|c| (c.peer_id.clone(), c.channel_state))
            .collect()
    }

    pub async fn connection_states(&self) -> HashMap<String, ConnectionState> {
        self.peers
            .read()
            .await
            .values()
            .map(|c| (c.peer_id.clone(), c.state))
            .collect()
    }

    /// Remove and return every connection. `on_drained` runs while the
    /// write lock is still held.
    pub async fn drain(&self, on_drained: impl FnOnce(&[PeerConnection])) -> Vec<PeerConnection> {
        let mut peers = self.peers.write().await;
        let drained: Vec<_> = peers.drain().map(|(_, c)| c).collect();
        on_drained(&drained);
        drained
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, PeerMap> {
        self.peers.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, PeerMap> {
        self.peers.write().await
    }

    /// Run `f` on the connection if it is registered under `generation`.
    pub(crate) async fn with_generation<R>(
        &self,
        peer_id: &str,
        generation: u64,
        f: impl FnOnce(&mut PeerConnection) -> R,
    ) -> Option<R> {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(conn) if conn.generation == generation => Some(f(conn)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MAX_INCOMING_FILE_SIZE;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::connection::{TransportEvents, TransportFactory};
    use tokio::sync::mpsc;

    async fn conn(peer: &str, generation: u64) -> PeerConnection {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = MemoryNetwork::new()
            .factory("me")
            .connect(peer, TransportEvents::new(peer, generation, tx))
            .await
            .unwrap();
        PeerConnection::new(peer, generation, Role::Initiator, adapter, MAX_INCOMING_FILE_SIZE)
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = TransferRegistry::new();
        assert!(registry.register(conn("bob", 1).await, |_| {}).await.is_none());

        let summary = registry.get("bob").await.unwrap();
        assert_eq!(summary.state, ConnectionState::New);
        assert_eq!(summary.channel_state, None);
        assert!(registry.channels_snapshot().await.is_empty());
        assert_eq!(
            registry.connection_states().await.get("bob"),
            Some(&ConnectionState::New)
        );

        let mut seen = None;
        let replaced = registry
            .register(conn("bob", 2).await, |old| seen = Some(old.generation))
            .await
            .unwrap();
        assert_eq!(replaced.generation, 1);
        assert_eq!(seen, Some(1));

        let mut removed = Vec::new();
        assert!(registry
            .unregister_generation("bob", 1, |c| removed.push(c.generation))
            .await
            .is_none());
        assert!(registry
            .unregister_generation("bob", 2, |c| removed.push(c.generation))
            .await
            .is_some());
        assert_eq!(removed, vec![2]);
        assert!(registry.get("bob").await.is_none());

        registry.register(conn("carol", 4).await, |_| {}).await;
        let mut hook_ran = false;
        assert!(registry.unregister("carol", |_| hook_ran = true).await.is_some());
        assert!(hook_ran);
        assert!(registry.unregister("carol", |_| unreachable!()).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let registry = TransferRegistry::new();
        registry.register(conn("bob", 3).await, |_| {}).await;

        let stale = registry
            .with_generation("bob", 2, |c| c.state = ConnectionState::Connected)
            .await;
        assert!(stale.is_none());
        assert!(registry
            .with_generation("bob", 3, |c| c.state = ConnectionState::Connecting)
            .await
            .is_some());
        assert_eq!(
            registry.get("bob").await.unwrap().state,
            ConnectionState::Connecting
        );
        assert!(registry.with_generation("carol", 3, |_| ()).await.is_none());
        let mut drained_under_lock = 0;
        assert_eq!(registry.drain(|conns| drained_under_lock = conns.len()).await.len(), 1);
        assert_eq!(drained_under_lock, 1);
        assert!(registry.connection_states().await.is_empty());
    }
}
