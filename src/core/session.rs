//! Session: the public face of the transfer core and its event loop.
//!
//! [`Session::new`] returns three things:
//!
//! - the [`Session`] handle (cheap to clone) used to signal and send files;
//! - the [`SessionDriver`], which the caller spawns. It is the single
//!   dispatcher that applies transport events in arrival order;
//! - the receiver of [`AppEvent`]s.
//!
//! Transport callbacks only ever enqueue events, so all connection and
//! transfer state changes happen either in the driver or in an explicit
//! API call, under the registry lock.

use crate::core::config::TransferConfig;
use crate::core::connection::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, PeerEvent, SessionDescription,
    SignalingMessage, SignalingRelay, TransportEvent, TransportFactory,
};
use crate::core::error::{Result, TransferError};
use crate::core::events::{AppEvent, EventSink};
use crate::core::progress::{Direction, ProgressKey, ProgressTable};
use crate::core::protocol::{self, OutgoingFile, OutgoingTransfer, ReceiveOutcome};
use crate::core::registry::PeerSummary;
use crate::core::signaling::SignalingCoordinator;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct SessionInner {
    coordinator: SignalingCoordinator,
    stop: SignalOfStop,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Applies queued transport events; run it with `tokio::spawn(driver.run())`.
pub struct SessionDriver {
    inner: Arc<SessionInner>,
    rx: mpsc::UnboundedReceiver<PeerEvent>,
    stop: SignalOfStop,
}

impl Session {
    /// A session whose caller relays signaling messages itself, using the
    /// returned descriptions and [`AppEvent::LocalCandidate`].
    pub fn new(
        config: TransferConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, SessionDriver, mpsc::UnboundedReceiver<AppEvent>)> {
        Self::build(config, factory, None)
    }

    /// A session that sends its descriptions and local candidates through
    /// `relay` on its own. Inbound relay traffic goes to [`Session::handle_signal`].
    pub fn with_relay(
        config: TransferConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Result<(Self, SessionDriver, mpsc::UnboundedReceiver<AppEvent>)> {
        Self::build(config, factory, Some(relay))
    }

    fn build(
        config: TransferConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Option<Arc<dyn SignalingRelay>>,
    ) -> Result<(Self, SessionDriver, mpsc::UnboundedReceiver<AppEvent>)> {
        config.validate()?;
        let (events, app_rx) = EventSink::channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let stop = SignalOfStop::new();
        let inner = Arc::new(SessionInner {
            coordinator: SignalingCoordinator::new(
                Arc::new(config),
                factory,
                relay,
                events,
                transport_tx,
            ),
            stop: stop.clone(),
        });
        let driver = SessionDriver {
            inner: inner.clone(),
            rx: transport_rx,
            stop,
        };
        Ok((Self { inner }, driver, app_rx))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.coordinator.config
    }

    // ── Signaling ─────────────────────────────────────────────────────────────

    /// Start a connection to `peer_id` and return the offer to relay.
    ///
    /// With a relay attached the offer has already been sent when this returns.
    pub async fn create_offer(&self, peer_id: &str) -> Result<SessionDescription> {
        let offer = self.inner.coordinator.create_offer(peer_id).await?;
        self.publish(peer_id, &offer).await?;
        Ok(offer)
    }

    /// Answer `offer` from `peer_id` and return the answer to relay.
    ///
    /// With a relay attached the answer has already been sent when this returns.
    pub async fn create_answer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let answer = self.inner.coordinator.create_answer(peer_id, offer).await?;
        self.publish(peer_id, &answer).await?;
        Ok(answer)
    }

    pub async fn handle_answer(&self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        self.inner.coordinator.handle_answer(peer_id, answer).await
    }

    pub async fn handle_ice_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        self.inner
            .coordinator
            .handle_ice_candidate(peer_id, candidate)
            .await
    }

    pub async fn disconnect_peer(&self, peer_id: &str) -> Result<()> {
        self.inner.coordinator.disconnect_peer(peer_id).await
    }

    /// Route one inbound relay message. Returns the reply for `from`, if the
    /// message calls for one (an answer to an offer).
    pub async fn handle_signal(
        &self,
        from: &str,
        msg: SignalingMessage,
    ) -> Result<Option<SignalingMessage>> {
        match msg {
            SignalingMessage::Offer { sdp } => {
                let answer = self
                    .create_answer(from, SessionDescription::offer(sdp))
                    .await?;
                Ok(Some(answer.into()))
            }
            SignalingMessage::Answer { sdp } => {
                self.handle_answer(from, SessionDescription::answer(sdp))
                    .await?;
                Ok(None)
            }
            SignalingMessage::IceCandidate { candidate } => {
                self.handle_ice_candidate(from, candidate).await?;
                Ok(None)
            }
        }
    }

    /// Hand the local description to the relay, then let local candidates
    /// follow it.
    async fn publish(&self, peer_id: &str, desc: &SessionDescription) -> Result<()> {
        if let Some(relay) = self.inner.coordinator.relay() {
            relay.send(peer_id, desc.clone().into()).await?;
        }
        self.inner
            .coordinator
            .release_local_candidates(peer_id)
            .await;
        Ok(())
    }

    // ── Transfers ─────────────────────────────────────────────────────────────

    /// Send `file` to `peer_id` and return its file id once `file-complete`
    /// has been emitted.
    ///
    /// Fails with [`TransferError::NoConnection`], changing nothing, when
    /// the peer has no open data channel. Transfers to the same peer are
    /// sent one after another in call order.
    pub async fn send_file(&self, peer_id: &str, file: OutgoingFile) -> Result<String> {
        let coordinator = &self.inner.coordinator;
        let config = coordinator.config.clone();

        let (dc, send_gate, generation, mut transfer) = {
            let mut peers = coordinator.registry.write().await;
            let conn = peers
                .get_mut(peer_id)
                .ok_or_else(|| TransferError::NoConnection(peer_id.to_string()))?;
            let dc = conn
                .open_channel()
                .ok_or_else(|| TransferError::NoConnection(peer_id.to_string()))?;
            let transfer = OutgoingTransfer::new(&file, config.chunk_size)?;
            conn.outgoing.push(transfer.file_id.clone());
            (dc, conn.send_gate.clone(), conn.generation, transfer)
        };
        let file_id = transfer.file_id.clone();

        let _turn = send_gate.lock().await;
        info!(
            event = "file_send_start",
            peer = %peer_id,
            file_id = %file_id,
            file_name = %transfer.file_name,
            bytes = transfer.file_size,
            chunks = transfer.total_chunks,
            "Sending file"
        );

        let key = ProgressKey::outgoing(&file_id);
        let on_progress = {
            let progress = coordinator.progress.clone();
            let events = coordinator.events.clone();
            let key = key.clone();
            let peer_id = peer_id.to_string();
            move |percent: f64| {
                let updated = progress
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .update(key.clone(), percent);
                if let Some(percent) = updated {
                    events.emit(AppEvent::Progress {
                        direction: Direction::Outgoing,
                        peer_id: peer_id.clone(),
                        file_id: key.file_id.clone(),
                        percent,
                    });
                }
            }
        };
        let result = protocol::send_file(dc.as_ref(), &file, &mut transfer, &config, on_progress).await;

        coordinator
            .registry
            .with_generation(peer_id, generation, |c| c.outgoing.retain(|id| id != &file_id))
            .await;
        coordinator.lock_progress().remove(&key);

        match result {
            Ok(()) => {
                info!(event = "file_sent", peer = %peer_id, file_id = %file_id, "File sent");
                coordinator.events.emit(AppEvent::FileSent {
                    peer_id: peer_id.to_string(),
                    file_id: file_id.clone(),
                    file_name: transfer.file_name,
                });
                Ok(file_id)
            }
            Err(e) => {
                warn!(
                    event = "file_send_aborted",
                    peer = %peer_id,
                    file_id = %file_id,
                    chunks_sent = transfer.chunks_sent,
                    error = %e,
                    "Transfer aborted"
                );
                coordinator.events.emit(AppEvent::TransferAborted {
                    direction: Direction::Outgoing,
                    peer_id: peer_id.to_string(),
                    file_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Whether any peer is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .coordinator
            .registry
            .connection_states()
            .await
            .values()
            .any(|s| *s == ConnectionState::Connected)
    }

    pub async fn channels_snapshot(&self) -> HashMap<String, ChannelState> {
        self.inner.coordinator.registry.channels_snapshot().await
    }

    pub async fn connection_states(&self) -> HashMap<String, ConnectionState> {
        self.inner.coordinator.registry.connection_states().await
    }

    pub fn progress_snapshot(&self) -> HashMap<ProgressKey, f64> {
        self.inner.coordinator.lock_progress().snapshot()
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerSummary> {
        self.inner.coordinator.registry.get(peer_id).await
    }

    /// Close every peer, clear all progress and stop the driver.
    pub async fn shutdown(&self) {
        info!(event = "session_shutdown", "Closing all peers");
        self.inner.coordinator.disconnect_all().await;
        self.inner.stop.cancel();
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

impl SessionDriver {
    pub async fn run(mut self) {
        debug!(event = "session_driver_start");
        while let Some(Some(event)) = self.stop.select(self.rx.recv()).await {
            self.inner.dispatch(event).await;
        }
        debug!(event = "session_driver_stop");
    }
}

impl SessionInner {
    async fn dispatch(&self, event: PeerEvent) {
        let PeerEvent {
            peer_id,
            generation,
            event,
        } = event;
        match event {
            TransportEvent::Message(msg) => self.on_message(&peer_id, generation, msg).await,
            other => {
                self.coordinator
                    .on_transport_event(&peer_id, generation, other)
                    .await
            }
        }
    }

    /// Feed one channel message to the peer's receiver and apply the outcome
    /// to the progress table while the registry entry is still locked.
    async fn on_message(&self, peer_id: &str, generation: u64, msg: ChannelMessage) {
        let events = self
            .coordinator
            .registry
            .with_generation(peer_id, generation, |conn| match conn.inbound.handle(msg) {
                Ok(Some(outcome)) => {
                    let mut progress = self.coordinator.lock_progress();
                    apply_outcome(peer_id, outcome, &mut progress)
                }
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!(event = "protocol_violation", peer = %peer_id, error = %e, "Dropped inbound message");
                    vec![AppEvent::Error {
                        peer_id: peer_id.to_string(),
                        message: e.to_string(),
                    }]
                }
            })
            .await;

        match events {
            Some(events) => {
                for event in events {
                    self.coordinator.events.emit(event);
                }
            }
            None => debug!(event = "message_dropped", peer = %peer_id, generation, "Message for unregistered peer dropped"),
        }
    }
}

fn apply_outcome(peer_id: &str, outcome: ReceiveOutcome, progress: &mut ProgressTable) -> Vec<AppEvent> {
    match outcome {
        ReceiveOutcome::Started {
            file_id,
            file_name,
            file_size,
            total_chunks,
        } => {
            info!(event = "file_recv_start", peer = %peer_id, %file_id, %file_name, bytes = file_size, chunks = total_chunks, "Receiving file");
            vec![AppEvent::IncomingFile {
                peer_id: peer_id.to_string(),
                file_id,
                file_name,
                file_size,
            }]
        }
        ReceiveOutcome::Progress { file_id, percent } => {
            match progress.update(ProgressKey::incoming(peer_id, &file_id), percent) {
                Some(percent) => vec![AppEvent::Progress {
                    direction: Direction::Incoming,
                    peer_id: peer_id.to_string(),
                    file_id,
                    percent,
                }],
                None => Vec::new(),
            }
        }
        ReceiveOutcome::Completed(file) => {
            progress.remove(&ProgressKey::incoming(peer_id, &file.file_id));
            info!(event = "file_received", peer = %peer_id, file_id = %file.file_id, file_name = %file.file_name, bytes = file.data.len(), "File received");
            vec![AppEvent::FileReceived {
                peer_id: peer_id.to_string(),
                file,
            }]
        }
        ReceiveOutcome::Aborted { file_id, reason } => {
            progress.remove(&ProgressKey::incoming(peer_id, &file_id));
            warn!(event = "file_recv_aborted", peer = %peer_id, %file_id, %reason, "Incomplete file discarded");
            vec![AppEvent::TransferAborted {
                direction: Direction::Incoming,
                peer_id: peer_id.to_string(),
                file_id,
                reason,
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WireFormat;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::connection::{DataChannel, TransportAdapter, TransportEvents};
    use crate::core::protocol::ControlMessage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Node {
        session: Session,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn node(net: &MemoryNetwork, name: &str, config: TransferConfig) -> Node {
        let (session, driver, events) = Session::new(config, Arc::new(net.factory(name))).unwrap();
        tokio::spawn(driver.run());
        Node { session, events }
    }

    /// Collect events until one satisfies `pred`; returns all of them.
    async fn until(
        rx: &mut mpsc::UnboundedReceiver<AppEvent>,
        pred: impl Fn(&AppEvent) -> bool,
    ) -> Vec<AppEvent> {
        let mut seen = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            let done = pred(&ev);
            seen.push(ev);
            if done {
                return seen;
            }
        }
    }

    async fn local_candidate(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> IceCandidate {
        match until(rx, |e| matches!(e, AppEvent::LocalCandidate { .. })).await.pop() {
            Some(AppEvent::LocalCandidate { candidate, .. }) => candidate,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Full offer/answer/candidate exchange between "alice" and "bob".
    async fn connected_pair(net: &MemoryNetwork, config: TransferConfig) -> (Node, Node) {
        let mut a = node(net, "alice", config.clone());
        let mut b = node(net, "bob", config);

        let offer = a.session.create_offer("bob").await.unwrap();
        let answer = b.session.create_answer("alice", offer).await.unwrap();
        a.session.handle_answer("bob", answer).await.unwrap();

        let ca = local_candidate(&mut a.events).await;
        let cb = local_candidate(&mut b.events).await;
        b.session.handle_ice_candidate("alice", ca).await.unwrap();
        a.session.handle_ice_candidate("bob", cb).await.unwrap();

        until(&mut a.events, |e| matches!(e, AppEvent::ChannelOpened { .. })).await;
        until(&mut b.events, |e| matches!(e, AppEvent::ChannelOpened { .. })).await;
        (a, b)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_connect_and_send_40000_bytes() {
        let net = MemoryNetwork::new();
        let (a, mut b) = connected_pair(&net, TransferConfig::default()).await;

        assert!(a.session.is_connected().await);
        assert!(b.session.is_connected().await);
        assert_eq!(
            a.session.connection_states().await.get("bob"),
            Some(&ConnectionState::Connected)
        );
        assert_eq!(
            b.session.channels_snapshot().await.get("alice"),
            Some(&ChannelState::Open)
        );

        let data = pattern(40000);
        let file_id = a
            .session
            .send_file("bob", OutgoingFile::from_bytes("a.bin", data.clone()))
            .await
            .unwrap();

        let seen = until(&mut b.events, |e| matches!(e, AppEvent::FileReceived { .. })).await;
        assert!(seen.iter().any(|e| matches!(
            e,
            AppEvent::IncomingFile { file_size: 40000, file_name, .. } if file_name == "a.bin"
        )));
        let percents: Vec<f64> = seen
            .iter()
            .filter_map(|e| match e {
                AppEvent::Progress { direction: Direction::Incoming, percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(100.0));

        match seen.last() {
            Some(AppEvent::FileReceived { peer_id, file }) => {
                assert_eq!(peer_id, "alice");
                assert_eq!(file.file_id, file_id);
                assert_eq!(file.data.len(), 40000);
                assert_eq!(&file.data[..], &data[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(a.session.progress_snapshot().is_empty());
        assert!(b.session.progress_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_responder_sends_framed_and_empty_files() {
        let net = MemoryNetwork::new();
        let config = TransferConfig {
            wire_format: WireFormat::Framed,
            chunk_size: 1000,
            ..Default::default()
        };
        let (mut a, b) = connected_pair(&net, config).await;

        let data = pattern(4500);
        b.session
            .send_file("alice", OutgoingFile::from_bytes("framed.bin", data.clone()))
            .await
            .unwrap();
        b.session
            .send_file("alice", OutgoingFile::from_bytes("empty.txt", Bytes::new()))
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            if let Some(AppEvent::FileReceived { file, .. }) =
                until(&mut a.events, |e| matches!(e, AppEvent::FileReceived { .. })).await.pop()
            {
                received.push(file);
            }
        }
        assert_eq!(received[0].file_name, "framed.bin");
        assert_eq!(&received[0].data[..], &data[..]);
        assert_eq!(received[1].file_name, "empty.txt");
        assert!(received[1].data.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_to_one_peer_arrive_in_call_order() {
        let net = MemoryNetwork::new();
        let (a, mut b) = connected_pair(&net, TransferConfig::default()).await;

        // Hold the peer's send gate so every spawned send has queued before
        // the first one starts.
        let gate = {
            let peers = a.session.inner.coordinator.registry.read().await;
            peers.get("bob").unwrap().send_gate.clone()
        };
        let held = gate.lock().await;

        let sizes = [200_000usize, 30_000, 1, 0, 45_000];
        let mut handles = Vec::new();
        for (i, size) in sizes.iter().copied().enumerate() {
            let session = a.session.clone();
            let file = OutgoingFile::from_bytes(format!("f{i}.bin"), pattern(size));
            handles.push(tokio::spawn(async move { session.send_file("bob", file).await }));
            while a.session.peer("bob").await.unwrap().outgoing_transfers < i + 1 {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);

        let mut sent_ids = Vec::new();
        for handle in handles {
            sent_ids.push(handle.await.unwrap().unwrap());
        }

        let mut received = Vec::new();
        while received.len() < sizes.len() {
            if let Some(AppEvent::FileReceived { file, .. }) =
                until(&mut b.events, |e| matches!(e, AppEvent::FileReceived { .. })).await.pop()
            {
                received.push(file);
            }
        }
        let received_ids: Vec<String> = received.iter().map(|f| f.file_id.clone()).collect();
        assert_eq!(received_ids, sent_ids);
        for (i, file) in received.iter().enumerate() {
            assert_eq!(file.file_name, format!("f{i}.bin"));
            assert_eq!(&file.data[..], &pattern(sizes[i])[..]);
        }
        assert_eq!(a.session.peer("bob").await.unwrap().outgoing_transfers, 0);
        assert!(a.session.progress_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_open_channel_changes_nothing() {
        let net = MemoryNetwork::new();
        let a = node(&net, "alice", TransferConfig::default());

        let err = a
            .session
            .send_file("carol", OutgoingFile::from_bytes("x", vec![1u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::NoConnection("carol".into()));
        assert!(a.session.peer("carol").await.is_none());

        // Offer made, channel still connecting.
        a.session.create_offer("bob").await.unwrap();
        let err = a
            .session
            .send_file("bob", OutgoingFile::from_bytes("x", vec![1u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::NoConnection("bob".into()));
        let summary = a.session.peer("bob").await.unwrap();
        assert_eq!(summary.outgoing_transfers, 0);
        assert_eq!(summary.channel_state, Some(ChannelState::Connecting));
        assert!(a.session.progress_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_file_id_is_reported_and_channel_survives() {
        let net = MemoryNetwork::new();
        let (a, mut b) = connected_pair(&net, TransferConfig::default()).await;

        let dc = {
            let peers = a.session.inner.coordinator.registry.read().await;
            peers.get("bob").and_then(|c| c.open_channel()).unwrap()
        };
        let stray = ControlMessage::FileChunk {
            file_id: "X".into(),
            chunk_index: 0,
            total_chunks: 1,
        };
        dc.send(ChannelMessage::Text(stray.encode().unwrap())).await.unwrap();
        dc.send(ChannelMessage::Binary(Bytes::from_static(b"orphan"))).await.unwrap();

        let seen = until(&mut b.events, |e| matches!(e, AppEvent::Error { .. })).await;
        assert!(matches!(seen.last(), Some(AppEvent::Error { peer_id, .. }) if peer_id == "alice"));
        until(&mut b.events, |e| matches!(e, AppEvent::Error { .. })).await;
        assert!(b.session.progress_snapshot().is_empty());

        a.session
            .send_file("bob", OutgoingFile::from_bytes("after.bin", vec![9u8; 100]))
            .await
            .unwrap();
        until(&mut b.events, |e| matches!(e, AppEvent::FileReceived { .. })).await;
        assert_eq!(b.session.peer("alice").await.unwrap().incoming_transfers, 0);
    }

    #[tokio::test]
    async fn test_channel_close_aborts_both_sides() {
        let net = MemoryNetwork::new();
        // file-info, envelope 0, payload 0, envelope 1, then the channel closes.
        net.close_channels_after(4);
        let (mut a, mut b) = connected_pair(&net, TransferConfig::default()).await;

        let err = a
            .session
            .send_file("bob", OutgoingFile::from_bytes("big.bin", pattern(16384 * 5)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));

        // The sender's abort and the driver's channel-closed event race.
        let mut a_seen = Vec::new();
        while !(a_seen.iter().any(|e| matches!(e, AppEvent::ChannelClosed { .. }))
            && a_seen.iter().any(|e| {
                matches!(e, AppEvent::TransferAborted { direction: Direction::Outgoing, .. })
            }))
        {
            a_seen.extend(until(&mut a.events, |_| true).await);
        }
        let seen = until(&mut b.events, |e| {
            matches!(e, AppEvent::TransferAborted { direction: Direction::Incoming, .. })
        })
        .await;
        assert!(seen.iter().any(|e| matches!(e, AppEvent::ChannelClosed { .. })));
        assert!(!seen.iter().any(|e| matches!(e, AppEvent::FileReceived { .. })));

        assert!(a.session.progress_snapshot().is_empty());
        assert!(b.session.progress_snapshot().is_empty());
        assert_eq!(b.session.peer("alice").await.unwrap().incoming_transfers, 0);
        assert_eq!(
            a.session.channels_snapshot().await.get("bob"),
            Some(&ChannelState::Closed)
        );
        let err = a
            .session
            .send_file("bob", OutgoingFile::from_bytes("again", vec![1u8]))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::NoConnection("bob".into()));
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown() {
        let net = MemoryNetwork::new();
        let (a, mut b) = connected_pair(&net, TransferConfig::default()).await;

        a.session.disconnect_peer("bob").await.unwrap();
        assert!(a.session.peer("bob").await.is_none());
        assert!(!a.session.is_connected().await);
        assert_eq!(
            a.session.disconnect_peer("bob").await,
            Err(TransferError::UnknownPeer("bob".into()))
        );

        until(&mut b.events, |e| {
            matches!(e, AppEvent::PeerStateChanged { state: ConnectionState::Disconnected, .. })
        })
        .await;
        assert_eq!(
            b.session.channels_snapshot().await.get("alice"),
            Some(&ChannelState::Closed)
        );

        b.session.shutdown().await;
        assert!(b.session.connection_states().await.is_empty());
        assert!(b.session.progress_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_reoffer_rules() {
        let net = MemoryNetwork::new();
        let (a, b) = connected_pair(&net, TransferConfig::default()).await;
        assert!(matches!(
            a.session.create_offer("bob").await,
            Err(TransferError::InvalidState { .. })
        ));
        assert!(matches!(
            b.session
                .create_answer("alice", SessionDescription::offer("memory:whatever"))
                .await,
            Err(TransferError::InvalidState { .. })
        ));

        // An offer that was never answered may be replaced.
        let c = node(&net, "carol", TransferConfig::default());
        c.session.create_offer("dave").await.unwrap();
        c.session.create_offer("dave").await.unwrap();
        assert_eq!(c.session.connection_states().await.len(), 1);
    }

    // ── Candidate queue ───────────────────────────────────────────────────────

    /// Records the remote candidates applied, in order.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<String>>,
        remote_set: Mutex<bool>,
    }

    struct RecordingFactory(Arc<Recorder>);
    struct RecordingAdapter(Arc<Recorder>);
    struct IdleChannel;

    #[async_trait]
    impl DataChannel for IdleChannel {
        fn label(&self) -> &str {
            "fileTransfer"
        }
        fn state(&self) -> ChannelState {
            ChannelState::Connecting
        }
        async fn send(&self, _msg: ChannelMessage) -> Result<()> {
            Err(TransferError::Transport("idle".into()))
        }
        async fn buffered_amount(&self) -> usize {
            0
        }
        async fn close(&self) {}
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn connect(&self, _peer_id: &str, _events: TransportEvents) -> Result<Arc<dyn TransportAdapter>> {
            Ok(Arc::new(RecordingAdapter(self.0.clone())))
        }
    }

    #[async_trait]
    impl TransportAdapter for RecordingAdapter {
        async fn create_channel(&self, _label: &str, _ordered: bool) -> Result<Arc<dyn DataChannel>> {
            Ok(Arc::new(IdleChannel))
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("answer"))
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            // Give concurrently arriving candidates a chance to interleave.
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.0.remote_set.lock().unwrap() = true;
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if !*self.0.remote_set.lock().unwrap() {
                return Err(TransferError::Transport("remote description not set".into()));
            }
            self.0.applied.lock().unwrap().push(candidate.candidate);
            Ok(())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_flushed_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (session, driver, _events) = Session::new(
            TransferConfig::default(),
            Arc::new(RecordingFactory(recorder.clone())),
        )
        .unwrap();
        tokio::spawn(driver.run());

        session.create_offer("bob").await.unwrap();
        for c in ["c1", "c2", "c3"] {
            session.handle_ice_candidate("bob", IceCandidate::new(c)).await.unwrap();
        }
        assert_eq!(session.peer("bob").await.unwrap().queued_candidates, 3);
        assert!(recorder.applied.lock().unwrap().is_empty());

        // c4 arrives while the answer is being applied and must wait for the flush.
        let late = {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                session.handle_ice_candidate("bob", IceCandidate::new("c4")).await
            })
        };
        session
            .handle_answer("bob", SessionDescription::answer("answer"))
            .await
            .unwrap();
        late.await.unwrap().unwrap();

        assert_eq!(*recorder.applied.lock().unwrap(), vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(session.peer("bob").await.unwrap().queued_candidates, 0);

        assert!(matches!(
            session.handle_answer("bob", SessionDescription::answer("again")).await,
            Err(TransferError::InvalidState { .. })
        ));
        assert_eq!(
            session.handle_answer("nobody", SessionDescription::answer("a")).await,
            Err(TransferError::UnknownPeer("nobody".into()))
        );
        assert_eq!(
            session.handle_ice_candidate("nobody", IceCandidate::new("c")).await,
            Err(TransferError::UnknownPeer("nobody".into()))
        );
    }
}
