//! Sender: framing an outgoing file into control envelopes and chunks.
//!
//! A transfer is `file-info`, then one chunk per index in increasing order,
//! then `file-complete`. Each chunk is either a `file-chunk` envelope
//! followed by the raw bytes ([`WireFormat::Split`]) or a single
//! [`ChunkFrame`] ([`WireFormat::Framed`]).
//!
//! The loop checks the channel before every chunk, so closing the channel
//! is the way to cancel a transfer. No receiver acknowledgement is awaited.

use super::frame::ChunkFrame;
use super::message::ControlMessage;
use crate::core::config::{
    TransferConfig, WireFormat, BACKPRESSURE_MAX_WAIT, BACKPRESSURE_POLL_INTERVAL,
};
use crate::core::connection::{ChannelMessage, DataChannel};
use crate::core::error::{Result, TransferError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, info, warn};

// ── File identifiers ──────────────────────────────────────────────────────────

static LAST_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// A decimal millisecond timestamp, strictly increasing within the process.
pub fn next_file_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut prev = LAST_FILE_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_FILE_ID.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => prev = actual,
        }
    }
}

/// `ceil(size / chunk_size)`; zero for an empty file. `None` when the
/// count does not fit the protocol's `u32` chunk indices.
pub fn total_chunks(size: u64, chunk_size: usize) -> Option<u32> {
    u32::try_from(size.div_ceil(chunk_size as u64)).ok()
}

// ── File sources ──────────────────────────────────────────────────────────────

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum OutgoingFile {
    Memory { name: String, data: Bytes },
    Disk { name: String, path: PathBuf, size: u64 },
}

impl OutgoingFile {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Stat a file on disk; its bytes are read chunk by chunk while sending.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(TransferError::Io(format!("{} is not a regular file", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::Disk {
            name,
            path: path.to_path_buf(),
            size: meta.len(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Memory { name, .. } | Self::Disk { name, .. } => name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Memory { data, .. } => data.len() as u64,
            Self::Disk { size, .. } => *size,
        }
    }

    async fn open(&self) -> Result<ChunkReader> {
        Ok(match self {
            Self::Memory { data, .. } => ChunkReader::Memory(data.clone()),
            Self::Disk { path, .. } => ChunkReader::Disk(tokio::fs::File::open(path).await?),
        })
    }
}

enum ChunkReader {
    Memory(Bytes),
    Disk(tokio::fs::File),
}

impl ChunkReader {
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            Self::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            Self::Disk(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

// ── Transfer ──────────────────────────────────────────────────────────────────

/// One file being sent to one peer.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub chunks_sent: u32,
}

impl OutgoingTransfer {
    /// Fails with [`TransferError::Io`] when `file` needs more chunks than
    /// a `u32` index can address at this chunk size.
    pub fn new(file: &OutgoingFile, chunk_size: usize) -> Result<Self> {
        let total_chunks = total_chunks(file.size(), chunk_size).ok_or_else(|| {
            TransferError::Io(format!(
                "{} ({} bytes) needs more than {} chunks of {chunk_size} bytes",
                file.name(),
                file.size(),
                u32::MAX
            ))
        })?;
        Ok(Self {
            file_id: next_file_id(),
            file_name: file.name().to_string(),
            file_size: file.size(),
            chunk_size,
            total_chunks,
            chunks_sent: 0,
        })
    }

    /// Byte offset and length of chunk `index`.
    pub fn chunk_range(&self, index: u32) -> (u64, usize) {
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.file_size);
        (start, (end - start) as usize)
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.chunks_sent as f64 / self.total_chunks as f64 * 100.0
    }

    fn info(&self) -> ControlMessage {
        ControlMessage::FileInfo {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            total_chunks: self.total_chunks,
        }
    }

    fn complete(&self) -> ControlMessage {
        ControlMessage::FileComplete {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
        }
    }
}

// ── Backpressure ──────────────────────────────────────────────────────────────

fn ensure_open(dc: &dyn DataChannel) -> Result<()> {
    if dc.is_open() {
        Ok(())
    } else {
        Err(TransferError::Transport(format!(
            "data channel '{}' is {:?}",
            dc.label(),
            dc.state()
        )))
    }
}

/// Poll until the channel's outbound buffer has room for `next_msg_size`
/// bytes, or give up waiting after [`BACKPRESSURE_MAX_WAIT`].
async fn wait_for_buffer_space(dc: &dyn DataChannel, next_msg_size: usize, high: usize) -> Result<()> {
    ensure_open(dc)?;
    let buffered = dc.buffered_amount().await;
    if buffered + next_msg_size <= high {
        return Ok(());
    }

    info!(
        channel = %dc.label(),
        buffered,
        next_msg = next_msg_size,
        high_watermark = high,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = tokio::time::Instant::now() + BACKPRESSURE_MAX_WAIT;
    loop {
        ensure_open(dc)?;
        if dc.buffered_amount().await + next_msg_size <= high {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }

    ensure_open(dc)?;
    let buffered = dc.buffered_amount().await;
    warn!(channel = %dc.label(), buffered, "Buffer drain timeout - proceeding anyway");
    Ok(())
}

async fn send_control(dc: &dyn DataChannel, msg: &ControlMessage) -> Result<()> {
    dc.send(ChannelMessage::Text(msg.encode()?)).await
}

// ── Send loop ─────────────────────────────────────────────────────────────────

/// Stream `file` over `dc`. `on_progress` is called after every chunk with
/// the updated sender-side percentage.
///
/// Returns an error, leaving the remaining chunks unsent, as soon as the
/// channel stops being open or a read or send fails.
pub async fn send_file(
    dc: &dyn DataChannel,
    file: &OutgoingFile,
    transfer: &mut OutgoingTransfer,
    config: &TransferConfig,
    mut on_progress: impl FnMut(f64),
) -> Result<()> {
    ensure_open(dc)?;
    let mut reader = file.open().await?;

    send_control(dc, &transfer.info()).await?;
    debug!(
        event = "file_info_sent",
        file_id = %transfer.file_id,
        file_size = transfer.file_size,
        total_chunks = transfer.total_chunks
    );

    for index in 0..transfer.total_chunks {
        let (offset, len) = transfer.chunk_range(index);
        let payload = reader.read(offset, len).await?;

        match config.wire_format {
            WireFormat::Split => {
                let envelope = ControlMessage::FileChunk {
                    file_id: transfer.file_id.clone(),
                    chunk_index: index,
                    total_chunks: transfer.total_chunks,
                };
                wait_for_buffer_space(dc, len, config.buffered_amount_high).await?;
                send_control(dc, &envelope).await?;
                dc.send(ChannelMessage::Binary(payload)).await?;
            }
            WireFormat::Framed => {
                let frame = ChunkFrame {
                    file_id: transfer.file_id.clone(),
                    chunk_index: index,
                    total_chunks: transfer.total_chunks,
                    payload,
                }
                .encode()?;
                wait_for_buffer_space(dc, frame.len(), config.buffered_amount_high).await?;
                dc.send(ChannelMessage::Binary(frame)).await?;
            }
        }

        transfer.chunks_sent = index + 1;
        on_progress(transfer.progress());

        if config.yield_every > 0 && index % config.yield_every == 0 {
            tokio::time::sleep(config.yield_delay()).await;
        }
    }

    ensure_open(dc)?;
    send_control(dc, &transfer.complete()).await?;
    Ok(())
}
