//! In-process transport for tests and offline demos.
//!
//! A [`MemoryNetwork`] links adapters created by its factories. It models
//! the parts of WebRTC the transfer core depends on:
//!
//! - offers and answers are opaque tokens that pair two adapters;
//! - `add_ice_candidate` fails until a remote description is applied;
//! - a connection goes `connecting` when the remote description is applied
//!   and `connected` once both sides applied a remote candidate;
//! - the initiator's channel surfaces on the responder as an inbound channel,
//!   then opens on both sides;
//! - messages are delivered in order through the session's event queue;
//! - closing one side reports `disconnected` and a closed channel remotely.

use super::types::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, SdpType, SessionDescription,
    TransportEvent, TransportEvents,
};
use super::{DataChannel, TransportAdapter, TransportFactory};
use crate::core::error::{Result, TransferError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

const SDP_PREFIX: &str = "memory:";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Network ───────────────────────────────────────────────────────────────────

/// Shared rendezvous for in-memory adapters.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_token: AtomicU64,
    /// Offers waiting for an answerer, keyed by token.
    offers: Mutex<HashMap<String, Arc<AdapterShared>>>,
    /// Fault injection: channels close after this many sent messages.
    close_channels_after: Mutex<Option<usize>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose adapters identify themselves as `local` in candidates.
    pub fn factory(&self, local: &str) -> MemoryFactory {
        MemoryFactory {
            network: self.inner.clone(),
            local: local.to_string(),
        }
    }

    /// Channels created from now on close themselves after `n` sent messages.
    pub fn close_channels_after(&self, n: usize) {
        *lock(&self.inner.close_channels_after) = Some(n);
    }
}

/// [`TransportFactory`] backed by a [`MemoryNetwork`].
pub struct MemoryFactory {
    network: Arc<NetworkInner>,
    local: String,
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn connect(
        &self,
        peer_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportAdapter>> {
        debug!(event = "memory_connect", local = %self.local, peer = %peer_id);
        let shared = Arc::new(AdapterShared {
            network: self.network.clone(),
            local: self.local.clone(),
            events,
            state: Mutex::new(AdapterState::default()),
        });
        Ok(Arc::new(MemoryAdapter { shared }))
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

struct MemoryAdapter {
    shared: Arc<AdapterShared>,
}

struct AdapterShared {
    network: Arc<NetworkInner>,
    local: String,
    events: TransportEvents,
    state: Mutex<AdapterState>,
}

#[derive(Default)]
struct AdapterState {
    token: Option<String>,
    remote: Weak<AdapterShared>,
    pair: Option<Arc<PairLink>>,
    local_description: bool,
    remote_description: bool,
    remote_candidates: usize,
    channel: Option<Arc<ChannelLink>>,
    closed: bool,
}

/// Shared by the two adapters of one connection.
struct PairLink {
    established: AtomicBool,
}

impl AdapterShared {
    fn ensure_open(&self) -> Result<()> {
        if lock(&self.state).closed {
            return Err(TransferError::Transport("connection closed".into()));
        }
        Ok(())
    }

    fn local_candidate(&self, token: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:memory 1 udp 1 {} 0 typ host {token}", self.local),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn ready(&self) -> bool {
        let state = lock(&self.state);
        !state.closed && state.remote_description && state.remote_candidates > 0
    }

    /// Bring the pair up once both sides are ready. Runs at most once.
    fn try_establish(self: &Arc<Self>) {
        let (remote, pair) = {
            let state = lock(&self.state);
            (state.remote.upgrade(), state.pair.clone())
        };
        let (Some(remote), Some(pair)) = (remote, pair) else {
            return;
        };
        if !self.ready() || !remote.ready() {
            return;
        }
        if pair.established.swap(true, Ordering::AcqRel) {
            return;
        }

        self.events
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        remote
            .events
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));

        // Whichever side created the channel is the initiator.
        let (initiator, responder) = if lock(&self.state).channel.is_some() {
            (self.clone(), remote)
        } else {
            (remote, self.clone())
        };
        let Some(link) = lock(&initiator.state).channel.clone() else {
            return;
        };
        link.pair_with(&responder.events);
        lock(&responder.state).channel = Some(link.clone());
        responder
            .events
            .emit(TransportEvent::IncomingChannel(Arc::new(MemoryChannel {
                link: link.clone(),
                side: Side::Responder,
            })));
        initiator.events.emit(TransportEvent::ChannelOpen);
        responder.events.emit(TransportEvent::ChannelOpen);
    }
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    async fn create_channel(&self, label: &str, _ordered: bool) -> Result<Arc<dyn DataChannel>> {
        self.shared.ensure_open()?;
        let close_after = *lock(&self.shared.network.close_channels_after);
        let link = Arc::new(ChannelLink {
            label: label.to_string(),
            close_after,
            inner: Mutex::new(LinkState {
                state: ChannelState::Connecting,
                initiator: self.shared.events.clone(),
                responder: None,
                sent: 0,
            }),
        });
        lock(&self.shared.state).channel = Some(link.clone());
        Ok(Arc::new(MemoryChannel {
            link,
            side: Side::Initiator,
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.shared.ensure_open()?;
        let n = self.shared.network.next_token.fetch_add(1, Ordering::Relaxed);
        let token = format!("{}-{n}", self.shared.local);
        {
            let mut state = lock(&self.shared.state);
            state.token = Some(token.clone());
            state.local_description = true;
        }
        lock(&self.shared.network.offers).insert(token.clone(), self.shared.clone());
        self.shared
            .events
            .emit(TransportEvent::LocalCandidate(self.shared.local_candidate(&token)));
        Ok(SessionDescription::offer(format!("{SDP_PREFIX}{token}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.shared.ensure_open()?;
        let token = {
            let mut state = lock(&self.shared.state);
            if !state.remote_description {
                return Err(TransferError::Transport(
                    "cannot answer before a remote offer is applied".into(),
                ));
            }
            state.local_description = true;
            state.token.clone().unwrap_or_default()
        };
        self.shared
            .events
            .emit(TransportEvent::LocalCandidate(self.shared.local_candidate(&token)));
        Ok(SessionDescription::answer(format!("{SDP_PREFIX}{token}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.shared.ensure_open()?;
        let token = desc
            .sdp
            .strip_prefix(SDP_PREFIX)
            .ok_or_else(|| TransferError::Transport("not a memory session description".into()))?
            .to_string();

        match desc.kind {
            SdpType::Offer => {
                let offerer = lock(&self.shared.network.offers)
                    .remove(&token)
                    .ok_or_else(|| TransferError::Transport(format!("unknown offer {token}")))?;
                let pair = Arc::new(PairLink {
                    established: AtomicBool::new(false),
                });
                {
                    let mut theirs = lock(&offerer.state);
                    theirs.remote = Arc::downgrade(&self.shared);
                    theirs.pair = Some(pair.clone());
                }
                let mut ours = lock(&self.shared.state);
                ours.token = Some(token);
                ours.remote = Arc::downgrade(&offerer);
                ours.pair = Some(pair);
                ours.remote_description = true;
            }
            SdpType::Answer => {
                let mut ours = lock(&self.shared.state);
                if ours.token.as_deref() != Some(token.as_str()) || ours.pair.is_none() {
                    return Err(TransferError::Transport(format!(
                        "answer {token} does not match a pending offer"
                    )));
                }
                ours.remote_description = true;
            }
        }
        self.shared
            .events
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.shared.ensure_open()?;
        {
            let mut state = lock(&self.shared.state);
            if !state.remote_description {
                return Err(TransferError::Transport(
                    "remote description not set".into(),
                ));
            }
            state.remote_candidates += 1;
        }
        debug!(event = "memory_candidate_applied", local = %self.shared.local, candidate = %candidate.candidate);
        self.shared.try_establish();
        Ok(())
    }

    async fn close(&self) {
        let (token, remote, channel, was_established) = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let established = state
                .pair
                .as_ref()
                .map(|p| p.established.load(Ordering::Acquire))
                .unwrap_or(false);
            (
                state.token.clone(),
                state.remote.upgrade(),
                state.channel.take(),
                established,
            )
        };
        if let Some(token) = token {
            lock(&self.shared.network.offers).remove(&token);
        }
        if let Some(link) = channel {
            link.close();
        }
        if let (Some(remote), true) = (remote, was_established) {
            remote
                .events
                .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
        self.shared
            .events
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Closed));
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Responder,
}

/// The shared wire between the two halves of a channel.
struct ChannelLink {
    label: String,
    close_after: Option<usize>,
    inner: Mutex<LinkState>,
}

struct LinkState {
    state: ChannelState,
    initiator: TransportEvents,
    responder: Option<TransportEvents>,
    sent: usize,
}

impl ChannelLink {
    fn pair_with(&self, responder: &TransportEvents) {
        let mut inner = lock(&self.inner);
        inner.responder = Some(responder.clone());
        if inner.state == ChannelState::Connecting {
            inner.state = ChannelState::Open;
        }
    }

    fn close(&self) {
        let (initiator, responder) = {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
            (inner.initiator.clone(), inner.responder.clone())
        };
        initiator.emit(TransportEvent::ChannelClosed);
        if let Some(responder) = responder {
            responder.emit(TransportEvent::ChannelClosed);
        }
    }
}

/// One half of an in-memory data channel.
pub struct MemoryChannel {
    link: Arc<ChannelLink>,
    side: Side,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.link.label
    }

    fn state(&self) -> ChannelState {
        lock(&self.link.inner).state
    }

    async fn send(&self, msg: ChannelMessage) -> Result<()> {
        let exhausted = {
            let mut inner = lock(&self.link.inner);
            if inner.state != ChannelState::Open {
                return Err(TransferError::Transport(format!(
                    "data channel '{}' not open",
                    self.link.label
                )));
            }
            let target = match self.side {
                Side::Initiator => inner.responder.clone(),
                Side::Responder => Some(inner.initiator.clone()),
            };
            if let Some(target) = target {
                target.emit(TransportEvent::Message(msg));
            }
            inner.sent += 1;
            self.link.close_after.is_some_and(|n| inner.sent >= n)
        };
        if exhausted {
            debug!(event = "memory_channel_fault", channel = %self.link.label, "Closing channel after configured message count");
            self.link.close();
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::PeerEvent;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.event);
        }
        out
    }

    fn candidates(events: &[TransportEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pairing_and_ordered_delivery() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = net
            .factory("alice")
            .connect("bob", TransportEvents::new("bob", 1, a_tx))
            .await
            .unwrap();
        let b = net
            .factory("bob")
            .connect("alice", TransportEvents::new("alice", 1, b_tx))
            .await
            .unwrap();

        let a_dc = a.create_channel("fileTransfer", true).await.unwrap();
        assert_eq!(a_dc.state(), ChannelState::Connecting);
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();

        // Candidates are rejected until the remote description is applied.
        let a_cands = candidates(&drain(&mut a_rx));
        assert!(a.add_ice_candidate(IceCandidate::new("early")).await.is_err());
        a.set_remote_description(answer).await.unwrap();

        let b_cands = candidates(&drain(&mut b_rx));
        b.add_ice_candidate(a_cands[0].clone()).await.unwrap();
        a.add_ice_candidate(b_cands[0].clone()).await.unwrap();

        assert_eq!(a_dc.state(), ChannelState::Open);
        let b_events = drain(&mut b_rx);
        let b_dc = b_events
            .iter()
            .find_map(|e| match e {
                TransportEvent::IncomingChannel(dc) => Some(dc.clone()),
                _ => None,
            })
            .expect("responder receives the channel");
        assert_eq!(b_dc.label(), "fileTransfer");

        a_dc.send(ChannelMessage::Text("one".into())).await.unwrap();
        a_dc.send(ChannelMessage::Binary(vec![2u8].into())).await.unwrap();
        let got: Vec<_> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(
            got,
            vec![
                ChannelMessage::Text("one".into()),
                ChannelMessage::Binary(vec![2u8].into())
            ]
        );

        a.close().await;
        assert_eq!(b_dc.state(), ChannelState::Closed);
        let b_events = drain(&mut b_rx);
        assert!(b_events.iter().any(|e| matches!(e, TransportEvent::ChannelClosed)));
        assert!(b_events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected)
        )));
    }

    #[tokio::test]
    async fn test_unknown_offer_rejected() {
        let net = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let b = net
            .factory("bob")
            .connect("alice", TransportEvents::new("alice", 1, tx))
            .await
            .unwrap();
        assert!(b
            .set_remote_description(SessionDescription::offer("memory:nope"))
            .await
            .is_err());
        assert!(b
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .is_err());
    }
}
