//! In-memory relay for tests.

use super::client::{Dialer, LinkEvent, RendezvousLink};
use crate::core::events::Subscription;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MemoryDialer {
    link: Mutex<Option<RendezvousLink>>,
    fail: AtomicBool,
    dials: AtomicUsize,
}

impl MemoryDialer {
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<RendezvousLink> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        self.link
            .lock()
            .take()
            .ok_or_else(|| anyhow!("relay already dialed"))
    }
}

/// The relay's side of a memory link.
pub struct RelayEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl RelayEnd {
    pub fn push(&self, msg: Value) {
        let _ = self.to_client.send(LinkEvent::Text(msg.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(LinkEvent::Text(text.to_string()));
    }

    pub fn close(&self, reason: Option<String>) {
        let _ = self.to_client.send(LinkEvent::Closed(reason));
    }

    /// Next message the client sent, or `None` once the client closed.
    pub async fn next_message(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .ok()??;
        serde_json::from_str(&text).ok()
    }
}

pub fn memory_relay() -> (MemoryDialer, RelayEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let dialer = MemoryDialer {
        link: Mutex::new(Some(RendezvousLink {
            outbound: out_tx,
            inbound: in_rx,
        })),
        fail: AtomicBool::new(false),
        dials: AtomicUsize::new(0),
    };
    let relay = RelayEnd {
        from_client: out_rx,
        to_client: in_tx,
    };
    (dialer, relay)
}

/// Await the next event on a subscription, failing the test after 5s.
pub async fn next_event<E>(rx: &mut Subscription<E>) -> E {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(ev)) => ev,
        Ok(None) => panic!("event bus closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}
