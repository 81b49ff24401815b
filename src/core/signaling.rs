//! Signaling Coordinator: brings a PeerConnection from `new` to `connected`.
//!
//! Offers, answers and remote candidates are applied under the connection's
//! signal gate, so a candidate that arrives while the remote description is
//! being applied waits until the queued ones are flushed. Transport events
//! (state changes, local candidates, channel lifecycle) are applied here by
//! the session dispatcher, one documented transition per event.

use crate::core::config::TransferConfig;
use crate::core::connection::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, PeerEvent, SdpType,
    SessionDescription, SignalingMessage, SignalingRelay, TransportAdapter, TransportEvent,
    TransportEvents, TransportFactory,
};
use crate::core::error::{Result, TransferError};
use crate::core::events::{AppEvent, EventSink};
use crate::core::progress::{Direction, ProgressKey, ProgressTable};
use crate::core::registry::{PeerConnection, Role, TransferRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub struct SignalingCoordinator {
    pub(crate) config: Arc<TransferConfig>,
    pub(crate) registry: TransferRegistry,
    pub(crate) progress: Arc<Mutex<ProgressTable>>,
    pub(crate) events: EventSink,
    factory: Arc<dyn TransportFactory>,
    relay: Option<Arc<dyn SignalingRelay>>,
    transport_tx: mpsc::UnboundedSender<PeerEvent>,
    next_generation: AtomicU64,
}

/// The signal gate of a connection, held, plus what is needed to act on it.
struct Signaling {
    _gate: OwnedMutexGuard<()>,
    generation: u64,
    adapter: Arc<dyn TransportAdapter>,
    role: Role,
    remote_description_set: bool,
}

impl SignalingCoordinator {
    pub(crate) fn new(
        config: Arc<TransferConfig>,
        factory: Arc<dyn TransportFactory>,
        relay: Option<Arc<dyn SignalingRelay>>,
        events: EventSink,
        transport_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            config,
            registry: TransferRegistry::new(),
            progress: Arc::new(Mutex::new(ProgressTable::new())),
            events,
            factory,
            relay,
            transport_tx,
            next_generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock_progress(&self) -> MutexGuard<'_, ProgressTable> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn relay(&self) -> Option<&Arc<dyn SignalingRelay>> {
        self.relay.as_ref()
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Create an initiator-role connection and its data channel, and return
    /// the local offer.
    pub async fn create_offer(&self, peer_id: &str) -> Result<SessionDescription> {
        self.ensure_replaceable(peer_id, Role::Initiator).await?;
        let (conn, adapter) = self.new_connection(peer_id, Role::Initiator).await?;
        let generation = conn.generation;
        let _gate = conn.signal_gate.clone().lock_owned().await;
        self.install(conn).await;

        let result = async {
            let dc = adapter
                .create_channel(&self.config.channel_label, self.config.ordered)
                .await?;
            self.registry
                .with_generation(peer_id, generation, |c| {
                    c.channel_state = dc.state();
                    c.channel = Some(dc.clone());
                })
                .await;
            adapter.create_offer().await
        }
        .await;

        match result {
            Ok(offer) => {
                info!(event = "offer_created", peer = %peer_id, generation, "Created offer");
                Ok(offer)
            }
            Err(e) => {
                warn!(event = "offer_failed", peer = %peer_id, error = %e, "Failed to create offer");
                self.abandon(peer_id, generation).await;
                Err(e)
            }
        }
    }

    /// Create a responder-role connection, apply `offer` and return the
    /// local answer. The data channel arrives later as an inbound channel.
    pub async fn create_answer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if offer.kind != SdpType::Offer {
            return Err(TransferError::invalid_state(
                peer_id,
                "create_answer requires a remote offer",
            ));
        }
        self.ensure_replaceable(peer_id, Role::Responder).await?;
        let (conn, adapter) = self.new_connection(peer_id, Role::Responder).await?;
        let generation = conn.generation;
        let _gate = conn.signal_gate.clone().lock_owned().await;
        self.install(conn).await;

        let result = async {
            adapter.set_remote_description(offer).await?;
            self.mark_remote_description(peer_id, generation, &adapter)
                .await;
            adapter.create_answer().await
        }
        .await;

        match result {
            Ok(answer) => {
                info!(event = "answer_created", peer = %peer_id, generation, "Created answer");
                Ok(answer)
            }
            Err(e) => {
                warn!(event = "answer_failed", peer = %peer_id, error = %e, "Failed to create answer");
                self.abandon(peer_id, generation).await;
                Err(e)
            }
        }
    }

    /// Apply the remote answer to an initiator awaiting one, then flush the
    /// queued candidates in arrival order.
    pub async fn handle_answer(&self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let signaling = self.lock_signaling(peer_id).await?;
        if signaling.role != Role::Initiator
            || signaling.remote_description_set
            || answer.kind != SdpType::Answer
        {
            return Err(TransferError::invalid_state(peer_id, "not awaiting an answer"));
        }

        signaling.adapter.set_remote_description(answer).await?;
        self.mark_remote_description(peer_id, signaling.generation, &signaling.adapter)
            .await;
        debug!(event = "answer_applied", peer = %peer_id, generation = signaling.generation);
        Ok(())
    }

    /// Apply `candidate` now if the remote description is set, otherwise
    /// queue it until it is.
    pub async fn handle_ice_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let signaling = self.lock_signaling(peer_id).await?;
        if signaling.remote_description_set {
            return signaling.adapter.add_ice_candidate(candidate).await;
        }
        let queued = self
            .registry
            .with_generation(peer_id, signaling.generation, |c| {
                c.candidate_queue.push(candidate);
                c.candidate_queue.len()
            })
            .await
            .ok_or_else(|| TransferError::UnknownPeer(peer_id.to_string()))?;
        debug!(event = "candidate_queued", peer = %peer_id, queued, "Remote description not set, queued candidate");
        Ok(())
    }

    /// Close the peer's channel and connection and forget all of its state.
    pub async fn disconnect_peer(&self, peer_id: &str) -> Result<()> {
        let conn = self
            .registry
            .unregister(peer_id, |c| self.lock_progress().clear_peer(peer_id, &c.outgoing))
            .await
            .ok_or_else(|| TransferError::UnknownPeer(peer_id.to_string()))?;
        info!(event = "peer_disconnect", peer = %peer_id, "Disconnecting peer");
        self.teardown(conn).await;
        self.events.emit(AppEvent::PeerStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Closed,
        });
        Ok(())
    }

    /// Disconnect every peer and clear the progress table.
    pub async fn disconnect_all(&self) {
        let conns = self.registry.drain(|_| self.lock_progress().clear()).await;
        for conn in conns {
            let peer_id = conn.peer_id.clone();
            self.teardown(conn).await;
            self.events.emit(AppEvent::PeerStateChanged {
                peer_id,
                state: ConnectionState::Closed,
            });
        }
    }

    // ── Transport events ──────────────────────────────────────────────────────

    /// Apply one connection-level transport event. Channel messages are
    /// handled by the session.
    pub(crate) async fn on_transport_event(&self, peer_id: &str, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged(state) => {
                let changed = self
                    .registry
                    .with_generation(peer_id, generation, |c| {
                        let changed = c.state != state && c.state != ConnectionState::Closed;
                        if changed {
                            c.state = state;
                        }
                        changed
                    })
                    .await;
                if changed == Some(true) {
                    info!(event = "peer_state", peer = %peer_id, %state, "Connection state changed");
                    self.events.emit(AppEvent::PeerStateChanged {
                        peer_id: peer_id.to_string(),
                        state,
                    });
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                let ready = self
                    .registry
                    .with_generation(peer_id, generation, |c| {
                        if c.local_candidates_released {
                            Some(candidate)
                        } else {
                            c.local_candidates.push(candidate);
                            None
                        }
                    })
                    .await
                    .flatten();
                if let Some(candidate) = ready {
                    self.deliver_local_candidate(peer_id, candidate).await;
                }
            }
            TransportEvent::IncomingChannel(dc) => {
                self.on_incoming_channel(peer_id, generation, dc).await;
            }
            TransportEvent::ChannelOpen => {
                let opened = self
                    .registry
                    .with_generation(peer_id, generation, |c| {
                        let opened = c.channel.is_some() && c.channel_state == ChannelState::Connecting;
                        if opened {
                            c.channel_state = ChannelState::Open;
                        }
                        opened
                    })
                    .await;
                if opened == Some(true) {
                    self.channel_opened(peer_id);
                }
            }
            TransportEvent::ChannelClosed => {
                self.on_channel_closed(peer_id, generation).await;
            }
            TransportEvent::ChannelError(message) => {
                if self.is_current(peer_id, generation).await {
                    warn!(event = "channel_error", peer = %peer_id, error = %message, "Data channel error");
                    self.events.emit(AppEvent::Error {
                        peer_id: peer_id.to_string(),
                        message,
                    });
                }
            }
            TransportEvent::Message(_) => {}
        }
    }

    async fn on_incoming_channel(&self, peer_id: &str, generation: u64, dc: Arc<dyn DataChannel>) {
        let accepted = self
            .registry
            .with_generation(peer_id, generation, |c| {
                if c.role != Role::Responder || c.channel.is_some() {
                    return None;
                }
                // The channel may have opened before this event was applied.
                c.channel_state = dc.state();
                c.channel = Some(dc.clone());
                Some(c.channel_state == ChannelState::Open)
            })
            .await;
        match accepted {
            Some(Some(open)) => {
                debug!(event = "incoming_channel", peer = %peer_id, label = %dc.label());
                if open {
                    self.channel_opened(peer_id);
                }
            }
            Some(None) => {
                warn!(event = "extra_channel_rejected", peer = %peer_id, label = %dc.label(), "Closing unexpected data channel");
                dc.close().await;
            }
            None => dc.close().await,
        }
    }

    async fn on_channel_closed(&self, peer_id: &str, generation: u64) {
        let discarded = self
            .registry
            .with_generation(peer_id, generation, |c| {
                if c.channel.is_none() || c.channel_state == ChannelState::Closed {
                    return None;
                }
                c.channel_state = ChannelState::Closed;
                let discarded = c.inbound.discard_all();
                let mut progress = self.lock_progress();
                for file_id in &discarded {
                    progress.remove(&ProgressKey::incoming(peer_id, file_id));
                }
                Some(discarded)
            })
            .await
            .flatten();
        let Some(discarded) = discarded else {
            return;
        };

        info!(event = "channel_closed", peer = %peer_id, orphaned = discarded.len(), "Data channel closed");
        self.events.emit(AppEvent::ChannelClosed {
            peer_id: peer_id.to_string(),
        });
        for file_id in discarded {
            self.events.emit(AppEvent::TransferAborted {
                direction: Direction::Incoming,
                peer_id: peer_id.to_string(),
                file_id,
                reason: "data channel closed".into(),
            });
        }
    }

    /// Start delivering local candidates for the peer's current connection,
    /// beginning with the ones gathered so far. Called once the local
    /// description has been handed to the relay, so candidates never
    /// overtake the description they belong to.
    pub(crate) async fn release_local_candidates(&self, peer_id: &str) {
        let held = {
            let mut peers = self.registry.write().await;
            match peers.get_mut(peer_id) {
                Some(c) if !c.local_candidates_released => {
                    c.local_candidates_released = true;
                    std::mem::take(&mut c.local_candidates)
                }
                _ => return,
            }
        };
        for candidate in held {
            self.deliver_local_candidate(peer_id, candidate).await;
        }
    }

    async fn deliver_local_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        if let Some(relay) = &self.relay {
            let msg = SignalingMessage::IceCandidate {
                candidate: candidate.clone(),
            };
            if let Err(e) = relay.send(peer_id, msg).await {
                warn!(event = "candidate_relay_failed", peer = %peer_id, error = %e);
            }
        }
        self.events.emit(AppEvent::LocalCandidate {
            peer_id: peer_id.to_string(),
            candidate,
        });
    }

    fn channel_opened(&self, peer_id: &str) {
        info!(event = "channel_open", peer = %peer_id, "Data channel open");
        self.events.emit(AppEvent::ChannelOpened {
            peer_id: peer_id.to_string(),
        });
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.registry
            .read()
            .await
            .get(peer_id)
            .is_some_and(|c| c.generation == generation)
    }

    /// A live connection may only be replaced once it has dropped.
    async fn ensure_replaceable(&self, peer_id: &str, role: Role) -> Result<()> {
        let peers = self.registry.read().await;
        let Some(c) = peers.get(peer_id) else {
            return Ok(());
        };
        if matches!(c.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(TransferError::invalid_state(
                peer_id,
                format!("connection is {}; disconnect first", c.state),
            ));
        }
        if role == Role::Responder && c.role == Role::Responder && c.remote_description_set {
            return Err(TransferError::invalid_state(peer_id, "offer already answered"));
        }
        Ok(())
    }

    async fn new_connection(
        &self,
        peer_id: &str,
        role: Role,
    ) -> Result<(PeerConnection, Arc<dyn TransportAdapter>)> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let events = TransportEvents::new(peer_id, generation, self.transport_tx.clone());
        let adapter = self.factory.connect(peer_id, events).await?;
        let conn = PeerConnection::new(
            peer_id,
            generation,
            role,
            adapter.clone(),
            self.config.max_incoming_file_size,
        );
        Ok((conn, adapter))
    }

    /// Register `conn`, tearing down whatever it replaces.
    async fn install(&self, conn: PeerConnection) {
        let peer_id = conn.peer_id.clone();
        let replaced = self
            .registry
            .register(conn, |old| self.lock_progress().clear_peer(&peer_id, &old.outgoing))
            .await;
        if let Some(old) = replaced {
            info!(event = "peer_replaced", peer = %peer_id, old_generation = old.generation, "Replacing previous connection");
            self.teardown(old).await;
        }
    }

    /// Drop a connection whose signaling failed, if it is still registered.
    async fn abandon(&self, peer_id: &str, generation: u64) {
        let conn = self
            .registry
            .unregister_generation(peer_id, generation, |c| {
                self.lock_progress().clear_peer(peer_id, &c.outgoing)
            })
            .await;
        if let Some(conn) = conn {
            self.teardown(conn).await;
        }
    }

    async fn teardown(&self, mut conn: PeerConnection) {
        let discarded = conn.inbound.discard_all();
        for file_id in discarded {
            self.events.emit(AppEvent::TransferAborted {
                direction: Direction::Incoming,
                peer_id: conn.peer_id.clone(),
                file_id,
                reason: "peer disconnected".into(),
            });
        }
        if let Some(dc) = conn.channel.take() {
            dc.close().await;
        }
        conn.adapter.close().await;
    }

    /// Wait for the peer's signal gate, retrying if the connection was
    /// replaced while waiting.
    async fn lock_signaling(&self, peer_id: &str) -> Result<Signaling> {
        loop {
            let (gate, generation) = {
                let peers = self.registry.read().await;
                let conn = peers
                    .get(peer_id)
                    .ok_or_else(|| TransferError::UnknownPeer(peer_id.to_string()))?;
                (conn.signal_gate.clone(), conn.generation)
            };
            let guard = gate.lock_owned().await;
            let peers = self.registry.read().await;
            match peers.get(peer_id) {
                Some(c) if c.generation == generation => {
                    return Ok(Signaling {
                        _gate: guard,
                        generation,
                        adapter: c.adapter.clone(),
                        role: c.role,
                        remote_description_set: c.remote_description_set,
                    });
                }
                Some(_) => continue,
                None => return Err(TransferError::UnknownPeer(peer_id.to_string())),
            }
        }
    }

    /// Record that the remote description is applied and flush the queued
    /// candidates in arrival order. The caller holds the signal gate.
    async fn mark_remote_description(
        &self,
        peer_id: &str,
        generation: u64,
        adapter: &Arc<dyn TransportAdapter>,
    ) {
        let queued = self
            .registry
            .with_generation(peer_id, generation, |c| {
                c.remote_description_set = true;
                std::mem::take(&mut c.candidate_queue)
            })
            .await
            .unwrap_or_default();
        if !queued.is_empty() {
            debug!(event = "candidate_flush", peer = %peer_id, count = queued.len(), "Applying queued candidates");
        }
        for candidate in queued {
            if let Err(e) = adapter.add_ice_candidate(candidate).await {
                warn!(event = "queued_candidate_failed", peer = %peer_id, error = %e, "Failed to apply queued candidate");
                self.events.emit(AppEvent::Error {
                    peer_id: peer_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}
