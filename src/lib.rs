//! Peer-to-peer file transfer over WebRTC data channels.
//!
//! Start with [`Session`]: it performs offer/answer signaling, sends files
//! as ordered chunks and reports everything it observes as [`AppEvent`]s.

pub mod core;
pub mod utils;
pub mod workers;

pub use crate::core::config::{TransferConfig, WireFormat};
pub use crate::core::connection::memory::MemoryNetwork;
pub use crate::core::connection::webrtc::WebRtcFactory;
pub use crate::core::connection::{
    ChannelState, ConnectionState, IceCandidate, SessionDescription, SignalingMessage,
    SignalingRelay, TransportFactory,
};
pub use crate::core::error::{Result, TransferError};
pub use crate::core::events::AppEvent;
pub use crate::core::progress::{Direction, ProgressKey};
pub use crate::core::protocol::{OutgoingFile, ReceivedFile};
pub use crate::core::session::{Session, SessionDriver};
