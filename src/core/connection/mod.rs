//! Transport abstraction.
//!
//! The transfer core never touches a concrete peer-connection API. It drives
//! a [`TransportAdapter`] per remote peer and a [`DataChannel`] per adapter,
//! and learns about everything asynchronous (state changes, candidates,
//! inbound channels, messages) through [`TransportEvent`]s queued on the
//! session's dispatcher.
//!
//! Two implementations ship with the crate: [`webrtc`] (real network) and
//! [`memory`] (in-process, deterministic).

pub mod memory;
pub mod types;
pub mod webrtc;

use crate::core::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use types::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, PeerEvent, SdpType,
    SessionDescription, SignalingMessage, TransportEvent, TransportEvents,
};

/// A message-oriented, ordered channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue one message. Fails if the channel is not open.
    async fn send(&self, msg: ChannelMessage) -> Result<()>;

    /// Bytes queued for sending but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn close(&self);
}

/// One peer-to-peer connection primitive.
///
/// Implementations report progress exclusively through the
/// [`TransportEvents`] handed to [`TransportFactory::connect`].
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Create the (single) outgoing data channel. Initiator role only.
    async fn create_channel(&self, label: &str, ordered: bool) -> Result<Arc<dyn DataChannel>>;

    /// Generate an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote candidate. Only valid once a remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self);
}

/// Creates adapters; one call per PeerConnection.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportAdapter>>;
}

/// The external signaling relay, consumed as a message pipe.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn send(&self, to: &str, msg: SignalingMessage) -> Result<()>;
}
