//! Chunked transfer protocol.
//!
//! - [`message`]: JSON control envelopes (`file-info`, `file-chunk`, `file-complete`)
//! - [`frame`]: the optional single-message binary chunk frame
//! - [`sender`]: splitting a file into envelopes and chunks
//! - [`receiver`]: reassembling inbound files and tracking their progress

pub mod frame;
pub mod message;
pub mod receiver;
pub mod sender;

pub use frame::ChunkFrame;
pub use message::ControlMessage;
pub use receiver::{InboundTransfers, IncomingTransfer, ReceiveOutcome, ReceivedFile};
pub use sender::{next_file_id, send_file, total_chunks, OutgoingFile, OutgoingTransfer};
