//! Self-delimiting binary chunk frame.
//!
//! One binary data-channel message per chunk, so the envelope and its
//! payload can never be separated:
//!
//!   [4 bytes: magic "SNC1"]
//!   [2 bytes: file id length BE] [N bytes: file id, UTF-8]
//!   [4 bytes: chunk index BE] [4 bytes: total chunks BE]
//!   [4 bytes: payload length BE] [payload]
//!
//! The explicit payload length lets the decoder reject truncated or padded
//! messages instead of silently storing them.

use crate::core::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_MAGIC: &[u8; 4] = b"SNC1";

/// Fixed part of the header, excluding the file id.
const FIXED_HEADER: usize = 4 + 2 + 4 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
}

impl ChunkFrame {
    /// Cheap check used to tell frames from raw payloads.
    pub fn is_frame(data: &[u8]) -> bool {
        data.len() >= FIXED_HEADER && data.starts_with(FRAME_MAGIC)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let id = self.file_id.as_bytes();
        let id_len = u16::try_from(id.len())
            .map_err(|_| TransferError::violation("file id too long for chunk frame"))?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| TransferError::violation("chunk payload too large for chunk frame"))?;

        let mut buf = BytesMut::with_capacity(FIXED_HEADER + id.len() + self.payload.len());
        buf.put_slice(FRAME_MAGIC);
        buf.put_u16(id_len);
        buf.put_slice(id);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.total_chunks);
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if !Self::is_frame(&data) {
            return Err(TransferError::violation("not a chunk frame"));
        }
        data.advance(FRAME_MAGIC.len());

        let id_len = data.get_u16() as usize;
        if data.remaining() < id_len + 12 {
            return Err(TransferError::violation("chunk frame header truncated"));
        }
        let file_id = std::str::from_utf8(&data[..id_len])
            .map_err(|_| TransferError::violation("chunk frame file id is not UTF-8"))?
            .to_string();
        data.advance(id_len);

        let chunk_index = data.get_u32();
        let total_chunks = data.get_u32();
        let payload_len = data.get_u32() as usize;
        if data.remaining() != payload_len {
            return Err(TransferError::violation(format!(
                "chunk frame declares {payload_len} payload bytes, carries {}",
                data.remaining()
            )));
        }

        Ok(Self {
            file_id,
            chunk_index,
            total_chunks,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkFrame {
        ChunkFrame {
            file_id: "1700000000000".into(),
            chunk_index: 2,
            total_chunks: 3,
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[..4], b"SNC1");
        assert_eq!(&bytes[4..6], &[0, 13]);
        assert_eq!(bytes.len(), FIXED_HEADER + 13 + 5);
        assert_eq!(&bytes[bytes.len() - 5..], b"hello");
        assert_eq!(ChunkFrame::decode(bytes).unwrap(), sample());
    }

    #[test]
    fn test_empty_payload() {
        let frame = ChunkFrame {
            payload: Bytes::new(),
            ..sample()
        };
        let decoded = ChunkFrame::decode(frame.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_rejects_truncated_and_padded() {
        let bytes = sample().encode().unwrap();
        assert!(ChunkFrame::decode(bytes.slice(..bytes.len() - 1)).is_err());

        let mut padded = BytesMut::from(&bytes[..]);
        padded.put_u8(0);
        assert!(ChunkFrame::decode(padded.freeze()).is_err());

        assert!(ChunkFrame::decode(bytes.slice(..8)).is_err());
        assert!(!ChunkFrame::is_frame(b"raw chunk bytes here"));
    }
}
