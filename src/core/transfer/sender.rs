//! ChunkSender: streams one file at a time over a data stream.
//!
//! The producer is pull-based. After each chunk it checks the stream's
//! buffered amount and only pulls the next slice once the amount is at or
//! below `BUFFERED_AMOUNT_LOW_THRESHOLD`, so memory held in the transport
//! stays bounded by the threshold plus one chunk regardless of how fast the
//! file can be read.
//!
//! Pause and stop are cooperative: both are observed before each pull and
//! while waiting for the buffer to drain, never in the middle of a write.

use super::file::OutgoingFile;
use super::frame::{self, FileMetadata, TransferStatus};
use crate::core::config::{BUFFERED_AMOUNT_LOW_THRESHOLD, CHUNK_SIZE};
use crate::core::error::TransferError;
use crate::core::events::EventBus;
use crate::core::transport::DataStream;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    Start {
        peer_id: String,
        file_id: u32,
        metadata: FileMetadata,
    },
    /// Whole percent of the declared size written so far.
    Progress {
        peer_id: String,
        file_id: u32,
        progress: u8,
    },
    /// A chunk was handed to the stream; cumulative bytes.
    Sent {
        peer_id: String,
        file_id: u32,
        bytes_sent: u64,
    },
    Complete {
        peer_id: String,
        file_id: u32,
        name: String,
    },
    Error {
        peer_id: String,
        file_id: u32,
        error: TransferError,
    },
}

/// `floor(done / total * 100)`, clamped to 100. An empty file is complete.
pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

struct ActiveTransfer {
    file_id: u32,
    stop: SignalOfStop,
}

enum Outcome {
    Done,
    Stopped,
}

pub struct ChunkSender {
    events: EventBus<SenderEvent>,
    next_file_id: AtomicU32,
    active: Mutex<Option<ActiveTransfer>>,
    paused: watch::Sender<bool>,
}

impl ChunkSender {
    pub fn new(events: EventBus<SenderEvent>) -> Self {
        Self {
            events,
            next_file_id: AtomicU32::new(0),
            active: Mutex::new(None),
            paused: watch::Sender::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active_file_id(&self) -> Option<u32> {
        self.active.lock().as_ref().map(|a| a.file_id)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Send `file` over `stream`. Resolves when the transfer ends.
    ///
    /// Rejected with [`TransferError::Busy`] while another transfer is in
    /// flight; the in-flight transfer is not affected. Every other outcome is
    /// also reported on the event bus.
    pub async fn send(
        &self,
        stream: &dyn DataStream,
        peer_id: &str,
        mut file: OutgoingFile,
    ) -> Result<(), TransferError> {
        let stop = SignalOfStop::new();
        let file_id = {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                warn!(
                    event = "send_rejected_busy",
                    peer = %peer_id,
                    active_file_id = current.file_id,
                    "Transfer already in progress"
                );
                return Err(TransferError::Busy);
            }
            let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            *active = Some(ActiveTransfer {
                file_id,
                stop: stop.clone(),
            });
            file_id
        };
        self.paused.send_replace(false);

        info!(
            event = "transfer_start",
            peer = %peer_id,
            file_id,
            name = %file.metadata.name,
            size = file.metadata.size,
            "Sending file"
        );

        let result = self.run(stream, peer_id, file_id, &mut file, &stop).await;
        *self.active.lock() = None;

        match result {
            Ok(Outcome::Done) => {
                info!(event = "transfer_complete", peer = %peer_id, file_id);
                self.events.emit(SenderEvent::Complete {
                    peer_id: peer_id.to_string(),
                    file_id,
                    name: file.metadata.name.clone(),
                });
                Ok(())
            }
            Ok(Outcome::Stopped) => {
                info!(event = "transfer_cancelled", peer = %peer_id, file_id);
                self.fail(peer_id, file_id, TransferError::Cancelled)
            }
            Err(e) => {
                warn!(event = "transfer_failure", peer = %peer_id, file_id, error = %e);
                self.fail(peer_id, file_id, e)
            }
        }
    }

    fn fail(&self, peer_id: &str, file_id: u32, error: TransferError) -> Result<(), TransferError> {
        self.events.emit(SenderEvent::Error {
            peer_id: peer_id.to_string(),
            file_id,
            error: error.clone(),
        });
        Err(error)
    }

    async fn run(
        &self,
        stream: &dyn DataStream,
        peer_id: &str,
        file_id: u32,
        file: &mut OutgoingFile,
        stop: &SignalOfStop,
    ) -> Result<Outcome, TransferError> {
        let write = |data: Bytes| async move {
            stream
                .send(data)
                .await
                .map_err(|_| TransferError::StreamClosed(peer_id.to_string()))
        };

        stream
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;

        let meta = frame::encode_metadata(file_id, &file.metadata)
            .map_err(|e| TransferError::Io(e.to_string()))?;
        write(meta).await?;
        self.events.emit(SenderEvent::Start {
            peer_id: peer_id.to_string(),
            file_id,
            metadata: file.metadata.clone(),
        });

        let size = file.metadata.size;
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut paused = self.paused.subscribe();

        loop {
            if *paused.borrow() {
                debug!(event = "transfer_paused", peer = %peer_id, file_id);
            }
            tokio::select! {
                biased;
                _ = stop.wait() => return Ok(self.abort(stream, file_id).await),
                // Map the borrow guard away before the arm completes.
                _ = async { let _ = paused.wait_for(|p| !*p).await; } => {}
            }

            // Never read past the declared size, even if the source grew.
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = tokio::select! {
                biased;
                _ = stop.wait() => return Ok(self.abort(stream, file_id).await),
                r = file.read_slice(&mut buf[..want]) => r?,
            };

            if n == 0 {
                if size == 0 {
                    self.events.emit(SenderEvent::Progress {
                        peer_id: peer_id.to_string(),
                        file_id,
                        progress: 100,
                    });
                }
                write(frame::encode_status(file_id, TransferStatus::Done)).await?;
                return Ok(Outcome::Done);
            }

            write(frame::encode_chunk(file_id, &buf[..n])).await?;
            sent += n as u64;

            self.events.emit(SenderEvent::Progress {
                peer_id: peer_id.to_string(),
                file_id,
                progress: percent(sent, size),
            });
            self.events.emit(SenderEvent::Sent {
                peer_id: peer_id.to_string(),
                file_id,
                bytes_sent: sent,
            });

            // A low notification can be stale, so re-check after each wake.
            while stream.buffered_amount().await > BUFFERED_AMOUNT_LOW_THRESHOLD {
                tokio::select! {
                    biased;
                    _ = stop.wait() => return Ok(self.abort(stream, file_id).await),
                    _ = stream.buffered_amount_low() => {}
                }
            }
        }
    }

    /// Tell the remote side the file will not complete. Best effort.
    async fn abort(&self, stream: &dyn DataStream, file_id: u32) -> Outcome {
        if let Err(e) = stream
            .send(frame::encode_status(file_id, TransferStatus::Failed))
            .await
        {
            debug!(event = "abort_status_not_sent", file_id, error = %e);
        }
        Outcome::Stopped
    }

    /// Suppress further pulls. Writes already queued are not recalled.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            debug!(event = "sender_pause");
        }
    }

    /// Clear the pause flag; the producer pulls again right away.
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            debug!(event = "sender_resume");
        }
    }

    /// Abort the active transfer, if any. Its `send` resolves with
    /// [`TransferError::Cancelled`].
    pub fn stop(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            info!(event = "sender_stop", file_id = active.file_id);
            active.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::frame::{decode, Frame};
    use crate::core::transport::memory::MemoryStream;
    use std::sync::Arc;
    use std::time::Duration;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn drain_forever(stream: Arc<MemoryStream>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                stream.drain(usize::MAX);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    fn chunk_bodies(frames: &[Bytes]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match decode(f).unwrap() {
                Frame::Chunk { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn progress_of(events: &mut crate::core::events::Subscription<SenderEvent>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let SenderEvent::Progress { progress, .. } = ev {
                out.push(progress);
            }
        }
        out
    }

    #[test]
    fn percent_floors_and_clamps() {
        assert_eq!(percent(65_536, 200_000), 32);
        assert_eq!(percent(199_999, 200_000), 99);
        assert_eq!(percent(200_000, 200_000), 100);
        assert_eq!(percent(300_000, 200_000), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[tokio::test]
    async fn two_hundred_thousand_bytes_make_six_frames() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sender = ChunkSender::new(bus);
        let stream = MemoryStream::new("file-transfer");
        let data = payload(200_000);

        sender
            .send(&*stream, "p1", OutgoingFile::from_bytes("big.bin", "", data.clone()))
            .await
            .unwrap();

        let frames = stream.frames();
        assert_eq!(frames.len(), 6);
        assert!(matches!(decode(&frames[0]).unwrap(), Frame::Metadata { file_id: 0, .. }));
        let sizes: Vec<usize> = frames[1..5].iter().map(|f| f.len() - 5).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 65_536, 3_392]);
        assert_eq!(
            decode(&frames[5]).unwrap(),
            Frame::Status { file_id: 0, status: "DONE" }
        );
        assert_eq!(chunk_bodies(&frames), data);
        assert_eq!(stream.threshold(), BUFFERED_AMOUNT_LOW_THRESHOLD);

        assert!(matches!(rx.try_recv().unwrap(), SenderEvent::Start { file_id: 0, .. }));
        let progress = progress_of(&mut rx);
        assert_eq!(progress, vec![32, 65, 98, 100]);
        assert!(!sender.is_busy());
    }

    #[tokio::test]
    async fn source_longer_than_declared_is_cut_at_size() {
        let stream = MemoryStream::new("file-transfer");
        let sender = ChunkSender::new(EventBus::new());
        let metadata = FileMetadata {
            name: "growing.log".into(),
            size: 4,
            mime: String::new(),
            last_modified: 0,
        };
        let reader = std::io::Cursor::new(b"abcdef".to_vec());

        sender
            .send(&*stream, "p", OutgoingFile::new(metadata, reader))
            .await
            .unwrap();

        let frames = stream.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(chunk_bodies(&frames), b"abcd");
        assert_eq!(
            decode(&frames[2]).unwrap(),
            Frame::Status { file_id: 0, status: "DONE" }
        );
    }

    #[tokio::test]
    async fn send_future_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}
        let sender = ChunkSender::new(EventBus::new());
        let stream = MemoryStream::new("file-transfer");
        let fut = sender.send(&*stream, "p", OutgoingFile::from_bytes("f", "", b"x".to_vec()));
        assert_send(&fut);
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn file_ids_increase_per_transfer() {
        let sender = ChunkSender::new(EventBus::new());
        let stream = MemoryStream::new("file-transfer");
        for name in ["a", "b"] {
            sender
                .send(&*stream, "p", OutgoingFile::from_bytes(name, "", b"x".to_vec()))
                .await
                .unwrap();
        }
        let ids: Vec<u32> = stream
            .frames()
            .iter()
            .map(|f| u32::from_le_bytes([f[1], f[2], f[3], f[4]]))
            .collect();
        assert_eq!(ids, vec![0, 0, 0, 1, 1, 1]);
    }

    #[tokio::test]
    async fn empty_file_reports_full_progress_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sender = ChunkSender::new(bus);
        let stream = MemoryStream::new("file-transfer");

        sender
            .send(&*stream, "p", OutgoingFile::from_bytes("empty", "", Vec::new()))
            .await
            .unwrap();

        assert_eq!(stream.frame_count(), 2);
        let _start = rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), SenderEvent::Progress { progress: 100, .. }));
        assert!(matches!(rx.try_recv().unwrap(), SenderEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn backpressure_stalls_until_drained() {
        let sender = Arc::new(ChunkSender::new(EventBus::new()));
        let stream = MemoryStream::stalled("file-transfer");
        let data = payload(16 * CHUNK_SIZE);

        let task = {
            let (sender, stream, data) = (sender.clone(), stream.clone(), data.clone());
            tokio::spawn(async move {
                sender
                    .send(&*stream, "p", OutgoingFile::from_bytes("f", "", data))
                    .await
            })
        };

        // Metadata plus 8 chunks pushes the buffer past 512 KiB.
        stream.wait_for_frames(9).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.frame_count(), 9);
        assert!(sender.is_busy());

        let drainer = drain_forever(stream.clone());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drainer.abort();

        assert_eq!(stream.frame_count(), 1 + 16 + 1);
        assert_eq!(chunk_bodies(&stream.frames()), data);
    }

    #[tokio::test]
    async fn second_send_is_rejected_without_touching_the_first() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sender = Arc::new(ChunkSender::new(bus));
        let stream = MemoryStream::stalled("file-transfer");

        let task = {
            let (sender, stream) = (sender.clone(), stream.clone());
            tokio::spawn(async move {
                sender
                    .send(&*stream, "p", OutgoingFile::from_bytes("f", "", payload(16 * CHUNK_SIZE)))
                    .await
            })
        };
        stream.wait_for_frames(9).await;

        let second = sender
            .send(&*stream, "p", OutgoingFile::from_bytes("g", "", b"other".to_vec()))
            .await;
        assert_eq!(second, Err(TransferError::Busy));

        sender.stop();
        let first = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Err(TransferError::Cancelled));
        assert!(!sender.is_busy());

        let frames = stream.frames();
        assert!(frames
            .iter()
            .all(|f| u32::from_le_bytes([f[1], f[2], f[3], f[4]]) == 0));
        assert_eq!(
            decode(frames.last().unwrap()).unwrap(),
            Frame::Status { file_id: 0, status: "FAILED" }
        );

        let mut saw_cancel = false;
        while let Ok(ev) = rx.try_recv() {
            if let SenderEvent::Error { error, .. } = ev {
                assert_eq!(error, TransferError::Cancelled);
                assert_eq!(error.to_string(), "File transfer cancelled.");
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn pause_holds_pulls_and_resume_continues_identically() {
        let sender = Arc::new(ChunkSender::new(EventBus::new()));
        let stream = MemoryStream::stalled("file-transfer");
        let data = payload(20 * CHUNK_SIZE + 123);

        let task = {
            let (sender, stream, data) = (sender.clone(), stream.clone(), data.clone());
            tokio::spawn(async move {
                sender
                    .send(&*stream, "p", OutgoingFile::from_bytes("f", "", data))
                    .await
            })
        };
        stream.wait_for_frames(9).await;

        sender.pause();
        assert!(sender.is_paused());
        stream.drain(usize::MAX);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.frame_count(), 9);

        sender.resume();
        let drainer = drain_forever(stream.clone());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drainer.abort();

        assert_eq!(chunk_bodies(&stream.frames()), data);
    }

    #[tokio::test]
    async fn closed_stream_fails_and_frees_the_slot() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sender = ChunkSender::new(bus);
        let stream = MemoryStream::new("file-transfer");
        stream.set_open(false);

        let r = sender
            .send(&*stream, "p", OutgoingFile::from_bytes("f", "", b"abc".to_vec()))
            .await;
        assert_eq!(r, Err(TransferError::StreamClosed("p".into())));
        assert!(!sender.is_busy());
        assert!(matches!(rx.try_recv().unwrap(), SenderEvent::Error { .. }));
    }
}
