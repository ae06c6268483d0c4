//! webrtc-rs implementation of the transport seam.
//!
//! One `RTCPeerConnection` per session, one ordered + fully reliable data
//! channel per stream. All callbacks are translated into [`TransportEvent`]s
//! on the session's event channel; nothing here touches negotiation state.

use super::{
    DataStream, IceCandidate, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportSession, TransportState,
};
use crate::core::config::{EngineConfig, DATA_STREAM_PROTOCOL};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ── Conversions ───────────────────────────────────────────────────────────────

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(c: RTCIceCandidateInit) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn map_state(s: RTCPeerConnectionState) -> Option<TransportState> {
    match s {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(TransportState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)
            .context("failed to register default interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await
                .context("failed to create peer connection")?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!(event = "ice_candidate_encode_failure", %e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s| {
            let tx = tx.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established")
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed")
                    }
                    other => debug!(event = "webrtc_state", state = %other),
                }
                if let Some(state) = map_state(s) {
                    let _ = tx.send(TransportEvent::StateChanged(state));
                }
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(event = "remote_stream", channel = %dc.label(), "Remote data stream announced");
                let stream = WebRtcDataStream::attach(dc, tx.clone()).await;
                let _ = tx.send(TransportEvent::RemoteStream(stream));
            })
        }));

        Ok(Arc::new(WebRtcSession { pc, events }))
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn open_data_stream(&self, label: &str) -> Result<Arc<dyn DataStream>> {
        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let init = RTCDataChannelInit {
            ordered: Some(true),
            protocol: Some(DATA_STREAM_PROTOCOL.to_string()),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .with_context(|| format!("failed to create data channel '{label}'"))?;
        let stream: Arc<dyn DataStream> = WebRtcDataStream::attach(dc, self.events.clone()).await;
        Ok(stream)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .context("failed to apply remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .context("failed to apply remote candidate")
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ── Data stream ───────────────────────────────────────────────────────────────

pub struct WebRtcDataStream {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

impl WebRtcDataStream {
    /// Wrap `dc` and install open/close/error/message/buffered-low handlers.
    async fn attach(
        dc: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        let label = dc.label().to_string();

        let tx = events.clone();
        let l = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!(event = "dc_open", channel = %l, "DataChannel open");
                let _ = tx.send(TransportEvent::StreamOpen { label: l });
            })
        }));

        let tx = events.clone();
        let l = label.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let l = l.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %l, "DataChannel closed by transport");
                let _ = tx.send(TransportEvent::StreamClosed { label: l });
            })
        }));

        let l = label.clone();
        dc.on_error(Box::new(move |err| {
            let l = l.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %l, %err, "DataChannel transport error");
            })
        }));

        let tx = events;
        let l = label;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let l = l.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::StreamMessage {
                    label: l,
                    data: msg.data,
                });
            })
        }));

        let low = Arc::new(Notify::new());
        let notify = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        }))
        .await;

        Arc::new(Self { dc, low })
    }
}

#[async_trait]
impl DataStream for WebRtcDataStream {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            warn!(event = "send_channel_not_open", ?state, "Attempted send on non-open data channel");
            anyhow::bail!("Data channel not open: {:?}", state);
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
