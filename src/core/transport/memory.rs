//! In-memory transport doubles for tests.

use super::{DataStream, IceCandidate, SessionDescription, TransportEvent, TransportFactory, TransportSession};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

// ── Data stream ───────────────────────────────────────────────────────────────

/// Records every frame written to it and simulates a send buffer.
///
/// With `auto_drain` set (the default) writes never accumulate; otherwise
/// the buffered amount grows by each frame and only shrinks on [`drain`].
///
/// [`drain`]: MemoryStream::drain
pub struct MemoryStream {
    label: String,
    open: AtomicBool,
    auto_drain: AtomicBool,
    buffered: AtomicUsize,
    threshold: AtomicUsize,
    low: Notify,
    written: Notify,
    frames: Mutex<Vec<Bytes>>,
}

impl MemoryStream {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            auto_drain: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            threshold: AtomicUsize::new(0),
            low: Notify::new(),
            written: Notify::new(),
            frames: Mutex::new(Vec::new()),
        })
    }

    /// A stream whose buffer only empties when the test calls `drain`.
    pub fn stalled(label: &str) -> Arc<Self> {
        let s = Self::new(label);
        s.auto_drain.store(false, Ordering::SeqCst);
        s
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Release `n` buffered bytes; fires the low notification once the
    /// amount drops to the threshold or below.
    pub fn drain(&self, n: usize) {
        let prev = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| Some(b.saturating_sub(n)))
            .unwrap_or(0);
        let now = prev.saturating_sub(n);
        if now <= self.threshold() {
            self.low.notify_one();
        }
    }

    /// Resolves once at least `n` frames have been written.
    pub async fn wait_for_frames(&self, n: usize) {
        loop {
            let notified = self.written.notified();
            if self.frame_count() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl DataStream for MemoryStream {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            bail!("stream {} is closed", self.label);
        }
        if !self.auto_drain.load(Ordering::SeqCst) {
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
        }
        self.frames.lock().push(data);
        self.written.notify_waiters();
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.set_open(false);
        Ok(())
    }
}

// ── Scripted session ──────────────────────────────────────────────────────────

/// Transport session that produces canned descriptions and records what the
/// negotiator applied to it. Tests inject transport events via [`emit`].
///
/// [`emit`]: ScriptedSession::emit
pub struct ScriptedSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    fail_offer: bool,
    stall_streams: bool,
    closed: AtomicBool,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    streams: Mutex<Vec<Arc<MemoryStream>>>,
}

impl ScriptedSession {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn local_stream(&self) -> Option<Arc<MemoryStream>> {
        self.streams.lock().first().cloned()
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn open_data_stream(&self, label: &str) -> Result<Arc<dyn DataStream>> {
        let stream = if self.stall_streams {
            MemoryStream::stalled(label)
        } else {
            MemoryStream::new(label)
        };
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.fail_offer {
            bail!("offer generation failed");
        }
        Ok(SessionDescription::offer("v=0 scripted-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 scripted-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            bail!("candidate applied before remote description");
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    fail_offer: AtomicBool,
    stall_streams: AtomicBool,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_offers(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    /// Locally opened streams only drain when the test says so.
    pub fn stall_streams(&self) {
        self.stall_streams.store(true, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        self.sessions.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<ScriptedSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>> {
        let session = Arc::new(ScriptedSession {
            events,
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            stall_streams: self.stall_streams.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
