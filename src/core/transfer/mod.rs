//! Chunked file transfer over an ordered, reliable data stream.

pub mod file;
pub mod frame;
pub mod receiver;
pub mod router;
pub mod sender;

pub use file::{OutgoingFile, ReceivedFile};
pub use frame::{FileMetadata, TransferStatus};
pub use receiver::{ChunkReceiver, ReceiverEvent};
pub use router::DataStreamRouter;
pub use sender::{ChunkSender, SenderEvent};
