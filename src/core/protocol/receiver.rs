//! Receiver: reassembly of inbound files from one peer's data channel.
//!
//! [`InboundTransfers`] is a synchronous state machine fed one channel
//! message at a time, in arrival order. It never touches the channel, the
//! registry or the progress table; it returns a [`ReceiveOutcome`] that the
//! session turns into progress updates and application events.
//!
//! Every malformed or unexpected message yields
//! [`TransferError::ProtocolViolation`] and leaves all other transfer state
//! untouched: the offending message is dropped and the channel stays usable.

use super::frame::ChunkFrame;
use super::message::ControlMessage;
use crate::core::config::MAX_CHUNK_SIZE;
use crate::core::connection::ChannelMessage;
use crate::core::error::{Result, TransferError};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: String,
    pub file_name: String,
    pub data: Bytes,
}

/// What a single inbound message did to the receive state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// A `file-info` opened a new transfer.
    Started {
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    /// Progress of a transfer moved to `percent` (0..=100).
    Progress { file_id: String, percent: f64 },
    Completed(ReceivedFile),
    /// `file-complete` arrived for a transfer that cannot be finalized.
    Aborted { file_id: String, reason: String },
}

/// One file being received.
#[derive(Debug)]
pub struct IncomingTransfer {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    progress: f64,
}

impl IncomingTransfer {
    fn new(file_id: String, file_name: String, file_size: u64, total_chunks: u32) -> Self {
        Self {
            file_id,
            file_name,
            file_size,
            total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            progress: 0.0,
        }
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Highest progress reported so far.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    fn percent(&self, chunks: u32) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        chunks as f64 / self.total_chunks as f64 * 100.0
    }

    fn advance(&mut self, percent: f64) -> f64 {
        if percent > self.progress {
            self.progress = percent;
        }
        self.progress
    }

    fn check_index(&self, chunk_index: u32, total_chunks: u32) -> Result<()> {
        if total_chunks != self.total_chunks {
            return Err(TransferError::violation(format!(
                "file {}: chunk declares {total_chunks} chunks, file-info declared {}",
                self.file_id, self.total_chunks
            )));
        }
        if chunk_index >= self.total_chunks {
            return Err(TransferError::violation(format!(
                "file {}: chunk index {chunk_index} out of range 0..{}",
                self.file_id, self.total_chunks
            )));
        }
        Ok(())
    }

    fn store(&mut self, chunk_index: u32, payload: Bytes) -> Result<f64> {
        if self.chunks.contains_key(&chunk_index) {
            return Err(TransferError::violation(format!(
                "file {}: duplicate payload for chunk {chunk_index}",
                self.file_id
            )));
        }
        let len = payload.len() as u64;
        if self.received_bytes + len > self.file_size {
            return Err(TransferError::violation(format!(
                "file {}: chunk {chunk_index} overflows declared size {}",
                self.file_id, self.file_size
            )));
        }
        self.received_bytes += len;
        self.chunks.insert(chunk_index, payload);
        let percent = self.percent(chunk_index + 1);
        Ok(self.advance(percent))
    }

    /// Concatenate chunks in index order, or explain why that is impossible.
    fn finish(self) -> std::result::Result<ReceivedFile, String> {
        if self.received_chunks() != self.total_chunks {
            return Err(format!(
                "received {} of {} chunks",
                self.received_chunks(),
                self.total_chunks
            ));
        }
        if self.received_bytes != self.file_size {
            return Err(format!(
                "received {} of {} bytes",
                self.received_bytes, self.file_size
            ));
        }
        let mut data = BytesMut::with_capacity(self.file_size as usize);
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }
        Ok(ReceivedFile {
            file_id: self.file_id,
            file_name: self.file_name,
            data: data.freeze(),
        })
    }
}

/// The chunk a `file-chunk` envelope announced for the next binary message.
#[derive(Debug, Clone)]
struct Announced {
    file_id: String,
    chunk_index: u32,
}

/// All inbound transfers from one peer.
#[derive(Debug)]
pub struct InboundTransfers {
    max_file_size: u64,
    transfers: HashMap<String, IncomingTransfer>,
    announced: Option<Announced>,
}

impl InboundTransfers {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            transfers: HashMap::new(),
            announced: None,
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&IncomingTransfer> {
        self.transfers.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Drop every in-flight transfer, returning their ids.
    pub fn discard_all(&mut self) -> Vec<String> {
        self.announced = None;
        self.transfers.drain().map(|(id, _)| id).collect()
    }

    /// Apply one inbound channel message.
    pub fn handle(&mut self, msg: ChannelMessage) -> Result<Option<ReceiveOutcome>> {
        match msg {
            ChannelMessage::Text(text) => {
                if let Some(lost) = self.announced.take() {
                    warn!(
                        event = "chunk_payload_missing",
                        file_id = %lost.file_id,
                        chunk_index = lost.chunk_index,
                        "Control message arrived where a chunk payload was expected"
                    );
                }
                self.handle_control(ControlMessage::decode(&text)?)
            }
            ChannelMessage::Binary(data) => self.handle_binary(data),
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<Option<ReceiveOutcome>> {
        match msg {
            ControlMessage::FileInfo {
                file_id,
                file_name,
                file_size,
                total_chunks,
            } => {
                self.validate_info(&file_id, file_size, total_chunks)?;
                debug!(event = "file_info", %file_id, %file_name, file_size, total_chunks);
                self.transfers.insert(
                    file_id.clone(),
                    IncomingTransfer::new(file_id.clone(), file_name.clone(), file_size, total_chunks),
                );
                Ok(Some(ReceiveOutcome::Started {
                    file_id,
                    file_name,
                    file_size,
                    total_chunks,
                }))
            }
            ControlMessage::FileChunk {
                file_id,
                chunk_index,
                total_chunks,
            } => {
                let transfer = self.transfer_mut(&file_id)?;
                transfer.check_index(chunk_index, total_chunks)?;
                let announced = transfer.percent(chunk_index);
                let percent = transfer.advance(announced);
                self.announced = Some(Announced {
                    file_id: file_id.clone(),
                    chunk_index,
                });
                Ok(Some(ReceiveOutcome::Progress { file_id, percent }))
            }
            ControlMessage::FileComplete { file_id, .. } => {
                let transfer = self
                    .transfers
                    .remove(&file_id)
                    .ok_or_else(|| unknown_transfer(&file_id))?;
                match transfer.finish() {
                    Ok(file) => Ok(Some(ReceiveOutcome::Completed(file))),
                    Err(reason) => Ok(Some(ReceiveOutcome::Aborted { file_id, reason })),
                }
            }
            ControlMessage::Unknown => {
                debug!(event = "control_unknown", "Ignoring control message of unknown type");
                Ok(None)
            }
        }
    }

    fn handle_binary(&mut self, data: Bytes) -> Result<Option<ReceiveOutcome>> {
        // A pending announcement wins: raw payloads may start with anything.
        if let Some(Announced {
            file_id,
            chunk_index,
        }) = self.announced.take()
        {
            let percent = self.transfer_mut(&file_id)?.store(chunk_index, data)?;
            return Ok(Some(ReceiveOutcome::Progress { file_id, percent }));
        }

        if !ChunkFrame::is_frame(&data) {
            return Err(TransferError::violation(
                "binary message without a preceding file-chunk envelope",
            ));
        }
        let frame = ChunkFrame::decode(data)?;
        let transfer = self.transfer_mut(&frame.file_id)?;
        transfer.check_index(frame.chunk_index, frame.total_chunks)?;
        let percent = transfer.store(frame.chunk_index, frame.payload)?;
        Ok(Some(ReceiveOutcome::Progress {
            file_id: frame.file_id,
            percent,
        }))
    }

    fn validate_info(&self, file_id: &str, file_size: u64, total_chunks: u32) -> Result<()> {
        if self.transfers.contains_key(file_id) {
            return Err(TransferError::violation(format!(
                "duplicate file-info for live transfer {file_id}"
            )));
        }
        if file_size > self.max_file_size {
            return Err(TransferError::violation(format!(
                "file {file_id}: size {file_size} exceeds limit {}",
                self.max_file_size
            )));
        }
        let chunks = u64::from(total_chunks);
        if chunks > file_size || (file_size > 0 && chunks == 0) {
            return Err(TransferError::violation(format!(
                "file {file_id}: {total_chunks} chunks cannot carry {file_size} bytes"
            )));
        }
        if file_size > chunks * MAX_CHUNK_SIZE as u64 {
            return Err(TransferError::violation(format!(
                "file {file_id}: chunks would exceed {MAX_CHUNK_SIZE} bytes"
            )));
        }
        Ok(())
    }

    fn transfer_mut(&mut self, file_id: &str) -> Result<&mut IncomingTransfer> {
        self.transfers
            .get_mut(file_id)
            .ok_or_else(|| unknown_transfer(file_id))
    }
}

fn unknown_transfer(file_id: &str) -> TransferError {
    TransferError::violation(format!("no transfer with fileId {file_id}"))
}
