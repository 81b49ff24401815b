//! Control envelopes exchanged on the file-transfer data channel.
//!
//! Every control message is a UTF-8 JSON object with a `type` tag and
//! camelCase fields, the shape browser peers speak:
//!
//! ```text
//! {"type":"file-info","fileId":"1700000000000","fileName":"a.bin","fileSize":40000,"totalChunks":3}
//! {"type":"file-chunk","fileId":"1700000000000","chunkIndex":0,"totalChunks":3}
//! {"type":"file-complete","fileId":"1700000000000","fileName":"a.bin"}
//! ```

use crate::core::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    FileInfo {
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    /// Announces that the next binary message is chunk `chunk_index`.
    #[serde(rename_all = "camelCase")]
    FileChunk {
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete { file_id: String, file_name: String },
    /// Any `type` this version does not know. Ignored by the receiver.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::FileInfo { file_id, .. }
            | Self::FileChunk { file_id, .. }
            | Self::FileComplete { file_id, .. } => Some(file_id),
            Self::Unknown => None,
        }
    }
}
