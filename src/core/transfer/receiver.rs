//! ChunkReceiver: rebuilds files from inbound frames.
//!
//! Relies on the data stream's ordered, exactly-once delivery. Chunks are
//! appended in arrival order with no resequencing, and completion happens
//! only on an explicit `DONE` status, never by byte count.

use super::file::ReceivedFile;
use super::frame::{self, FileMetadata, Frame};
use super::sender::percent;
use crate::core::config::HEADER_SIZE;
use crate::core::error::{ProtocolViolation, TransferError};
use crate::core::events::EventBus;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Start {
        peer_id: String,
        file_id: u32,
        metadata: FileMetadata,
    },
    Progress {
        peer_id: String,
        file_id: u32,
        progress: u8,
    },
    /// Every well-formed inbound frame, raw.
    Data {
        peer_id: String,
        frame: Bytes,
    },
    Complete {
        peer_id: String,
        file_id: u32,
        file: ReceivedFile,
    },
    Error {
        peer_id: String,
        file_id: u32,
        error: TransferError,
    },
}

struct InboundRecord {
    metadata: FileMetadata,
    chunks: Vec<Bytes>,
    received: u64,
}

pub struct ChunkReceiver {
    events: EventBus<ReceiverEvent>,
    records: Mutex<HashMap<u32, InboundRecord>>,
}

impl ChunkReceiver {
    pub fn new(events: EventBus<ReceiverEvent>) -> Self {
        Self {
            events,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// File ids with a reconstruction in progress.
    pub fn pending(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.records.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every partial reconstruction.
    pub fn clear(&self) {
        let mut records = self.records.lock();
        if !records.is_empty() {
            info!(event = "receiver_cleared", pending = records.len());
        }
        records.clear();
    }

    /// Handle one inbound message. Malformed frames are logged and dropped.
    pub fn receive(&self, peer_id: &str, message: Bytes) {
        let parsed = match frame::decode(&message) {
            Ok(f) => f,
            Err(ProtocolViolation::ShortFrame(len)) => {
                debug!(event = "frame_too_short", peer = %peer_id, len);
                return;
            }
            Err(e) => {
                warn!(event = "frame_rejected", peer = %peer_id, error = %e);
                return;
            }
        };

        self.events.emit(ReceiverEvent::Data {
            peer_id: peer_id.to_string(),
            frame: message.clone(),
        });

        match parsed {
            Frame::Metadata { file_id, metadata } => self.on_metadata(peer_id, file_id, metadata),
            Frame::Chunk { file_id, .. } => {
                self.on_chunk(peer_id, file_id, message.slice(HEADER_SIZE..))
            }
            Frame::Status { file_id, status } => self.on_status(peer_id, file_id, status),
        }
    }

    fn on_metadata(&self, peer_id: &str, file_id: u32, metadata: FileMetadata) {
        info!(
            event = "receive_start",
            peer = %peer_id,
            file_id,
            name = %metadata.name,
            size = metadata.size,
            "Incoming file"
        );
        let previous = self.records.lock().insert(
            file_id,
            InboundRecord {
                metadata: metadata.clone(),
                chunks: Vec::new(),
                received: 0,
            },
        );
        if let Some(prev) = previous {
            warn!(
                event = "metadata_duplicate",
                peer = %peer_id,
                file_id,
                discarded_bytes = prev.received,
                "Metadata repeated for a tracked file; restarting it"
            );
        }
        self.events.emit(ReceiverEvent::Start {
            peer_id: peer_id.to_string(),
            file_id,
            metadata,
        });
    }

    fn on_chunk(&self, peer_id: &str, file_id: u32, chunk: Bytes) {
        let progress = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(&file_id) else {
                warn!(
                    event = "chunk_unknown_file",
                    peer = %peer_id,
                    error = %ProtocolViolation::UnknownFile(file_id),
                    "Dropping chunk"
                );
                return;
            };
            let declared = record.metadata.size;
            if record.received + chunk.len() as u64 > declared {
                let violation = ProtocolViolation::SizeExceeded { file_id, declared };
                warn!(
                    event = "chunk_exceeds_size",
                    peer = %peer_id,
                    received = record.received,
                    chunk = chunk.len(),
                    error = %violation,
                    "Dropping chunk"
                );
                return;
            }
            record.received += chunk.len() as u64;
            record.chunks.push(chunk);
            percent(record.received, declared)
        };
        self.events.emit(ReceiverEvent::Progress {
            peer_id: peer_id.to_string(),
            file_id,
            progress,
        });
    }

    fn on_status(&self, peer_id: &str, file_id: u32, status: &str) {
        let record = self.records.lock().remove(&file_id);

        // Failure is reported even when the file is not tracked here.
        if status != "DONE" {
            warn!(
                event = "receive_failed",
                peer = %peer_id,
                file_id,
                %status,
                discarded_bytes = record.as_ref().map_or(0, |r| r.received)
            );
            self.events.emit(ReceiverEvent::Error {
                peer_id: peer_id.to_string(),
                file_id,
                error: TransferError::RemoteFailed(status.to_string()),
            });
            return;
        }

        let Some(record) = record else {
            warn!(event = "status_unknown_file", peer = %peer_id, file_id, %status);
            return;
        };

        let mut data = BytesMut::with_capacity(record.received as usize);
        for chunk in &record.chunks {
            data.extend_from_slice(chunk);
        }

        if record.metadata.size == 0 {
            self.events.emit(ReceiverEvent::Progress {
                peer_id: peer_id.to_string(),
                file_id,
                progress: 100,
            });
        }

        info!(
            event = "receive_complete",
            peer = %peer_id,
            file_id,
            name = %record.metadata.name,
            bytes = data.len()
        );
        self.events.emit(ReceiverEvent::Complete {
            peer_id: peer_id.to_string(),
            file_id,
            file: ReceivedFile {
                metadata: record.metadata,
                data: data.freeze(),
            },
        });
    }
}
