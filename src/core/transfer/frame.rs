//! Transfer wire format.
//!
//! ```text
//! [type: u8][file_id: u32 LE][body...]
//! ```
//!
//! | type | body                                                    |
//! |------|---------------------------------------------------------|
//! | 0x01 | UTF-8 JSON `{"metadata":{name,size,type,lastModified}}` |
//! | 0x02 | raw chunk bytes (at most `CHUNK_SIZE`)                   |
//! | 0x03 | UTF-8 status text, `DONE` or `FAILED`                   |

use crate::core::config::HEADER_SIZE;
use crate::core::error::ProtocolViolation;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Metadata = 0x01,
    Chunk = 0x02,
    Status = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolViolation;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x01 => Ok(Self::Metadata),
            0x02 => Ok(Self::Chunk),
            0x03 => Ok(Self::Status),
            other => Err(ProtocolViolation::UnknownFrameType(other)),
        }
    }
}

/// Descriptive file attributes carried by the metadata frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// MIME type, empty when unknown.
    #[serde(rename = "type", default)]
    pub mime: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "lastModified", default)]
    pub last_modified: u64,
}

#[derive(Serialize, Deserialize)]
struct MetadataBody {
    metadata: FileMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Done,
    Failed,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

/// A decoded frame. Bodies borrow from the received message.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Metadata { file_id: u32, metadata: FileMetadata },
    Chunk { file_id: u32, data: &'a [u8] },
    /// Raw status text; anything other than `DONE` is a failure.
    Status { file_id: u32, status: &'a str },
}

pub fn encode(kind: FrameKind, file_id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u8(kind as u8);
    buf.put_u32_le(file_id);
    buf.put_slice(body);
    buf.freeze()
}

pub fn encode_metadata(file_id: u32, metadata: &FileMetadata) -> Result<Bytes, ProtocolViolation> {
    let body = serde_json::to_vec(&MetadataBody {
        metadata: metadata.clone(),
    })
    .map_err(|e| ProtocolViolation::BadMetadata(e.to_string()))?;
    Ok(encode(FrameKind::Metadata, file_id, &body))
}

pub fn encode_chunk(file_id: u32, data: &[u8]) -> Bytes {
    encode(FrameKind::Chunk, file_id, data)
}

pub fn encode_status(file_id: u32, status: TransferStatus) -> Bytes {
    encode(FrameKind::Status, file_id, status.as_str().as_bytes())
}

pub fn decode(frame: &[u8]) -> Result<Frame<'_>, ProtocolViolation> {
    if frame.len() < HEADER_SIZE {
        return Err(ProtocolViolation::ShortFrame(frame.len()));
    }
    let kind = FrameKind::try_from(frame[0])?;
    let file_id = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let body = &frame[HEADER_SIZE..];

    Ok(match kind {
        FrameKind::Metadata => {
            let parsed: MetadataBody = serde_json::from_slice(body)
                .map_err(|e| ProtocolViolation::BadMetadata(e.to_string()))?;
            Frame::Metadata {
                file_id,
                metadata: parsed.metadata,
            }
        }
        FrameKind::Chunk => Frame::Chunk { file_id, data: body },
        FrameKind::Status => Frame::Status {
            file_id,
            status: std::str::from_utf8(body).unwrap_or(""),
        },
    })
}
