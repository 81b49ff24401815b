//! WebRTC transport: `webrtc` crate peer connections and data channels.
//!
//! Every `RTCPeerConnection` / `RTCDataChannel` callback is translated into a
//! [`TransportEvent`] and queued for the session dispatcher. The callbacks
//! capture nothing but the event sender, so no protocol state is reachable
//! from transport threads.

use super::types::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, SdpType, SessionDescription,
    TransportEvent, TransportEvents,
};
use super::{DataChannel, TransportAdapter, TransportFactory};
use crate::core::config::TransferConfig;
use crate::core::error::{Result, TransferError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
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

impl From<webrtc::Error> for TransferError {
    fn from(e: webrtc::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

// ── State mapping ─────────────────────────────────────────────────────────────

pub(crate) fn map_connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
            ConnectionState::Disconnected
        }
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

pub(crate) fn map_channel_state(s: RTCDataChannelState) -> ChannelState {
    match s {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
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
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Builds one `RTCPeerConnection` per remote peer.
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
    include_loopback: bool,
}

impl WebRtcFactory {
    pub fn new(config: &TransferConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();
        Self {
            ice_servers,
            include_loopback: false,
        }
    }

    /// Gather loopback candidates too (both peers on one host).
    pub fn with_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    fn build_api(&self) -> Result<webrtc::api::API> {
        let mut me = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut me)?;

        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(self.include_loopback);

        Ok(APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn connect(
        &self,
        peer_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportAdapter>> {
        debug!(event = "webrtc_connect", peer = %peer_id, ice_servers = self.ice_servers.len());
        let api = self.build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let ev = ev.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", peer = %ev.peer_id(), "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", peer = %ev.peer_id(), "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", peer = %ev.peer_id(), "WebRTC connection lost");
                    }
                    other => {
                        debug!(event = "webrtc_state", peer = %ev.peer_id(), state = ?other);
                    }
                }
                ev.emit(TransportEvent::ConnectionStateChanged(map_connection_state(s)));
            })
        }));

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    debug!(event = "ice_gathering_complete", peer = %ev.peer_id());
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => ev.emit(TransportEvent::LocalCandidate(init.into())),
                    Err(e) => {
                        warn!(event = "ice_candidate_encode_failure", peer = %ev.peer_id(), error = %e);
                    }
                }
            })
        }));

        let ev = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let ev = ev.clone();
            Box::pin(async move {
                info!(event = "dc_incoming", peer = %ev.peer_id(), channel = %dc.label(), "Remote opened a data channel");
                let channel = WebRtcChannel::new(dc);
                ev.emit(TransportEvent::IncomingChannel(channel.clone()));
                channel.attach_handlers(ev);
            })
        }));

        Ok(Arc::new(WebRtcAdapter { pc, events }))
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

struct WebRtcAdapter {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
}

#[async_trait]
impl TransportAdapter for WebRtcAdapter {
    async fn create_channel(&self, label: &str, ordered: bool) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        let channel = WebRtcChannel::new(dc);
        channel.attach_handlers(self.events.clone());
        Ok(channel)
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
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "webrtc_close_failure", peer = %self.events.peer_id(), error = %e);
        }
    }
}

// ── Data channel ──────────────────────────────────────────────────────────────

/// An `RTCDataChannel` behind the [`DataChannel`] trait.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = dc.label().to_string();
        Arc::new(Self { dc, label })
    }

    /// Route `on_open`, `on_close`, `on_error`, and `on_message` into `events`.
    fn attach_handlers(&self, events: TransportEvents) {
        let ev = events.clone();
        self.dc.on_open(Box::new(move || {
            let ev = ev.clone();
            Box::pin(async move {
                info!(event = "dc_open", peer = %ev.peer_id(), "DataChannel open");
                ev.emit(TransportEvent::ChannelOpen);
            })
        }));

        let ev = events.clone();
        self.dc.on_close(Box::new(move || {
            let ev = ev.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", peer = %ev.peer_id(), "DataChannel closed by transport");
                ev.emit(TransportEvent::ChannelClosed);
            })
        }));

        let ev = events.clone();
        self.dc.on_error(Box::new(move |err: webrtc::Error| {
            let ev = ev.clone();
            Box::pin(async move {
                error!(event = "dc_error", peer = %ev.peer_id(), %err, "DataChannel transport error");
                ev.emit(TransportEvent::ChannelError(err.to_string()));
            })
        }));

        let ev = events;
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let ev = ev.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelMessage::Text(text),
                        Err(_) => {
                            warn!(event = "dc_invalid_utf8", peer = %ev.peer_id(), bytes = msg.data.len());
                            ChannelMessage::Binary(msg.data)
                        }
                    }
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                ev.emit(TransportEvent::Message(message));
            })
        }));
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        map_channel_state(self.dc.ready_state())
    }

    async fn send(&self, msg: ChannelMessage) -> Result<()> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(TransferError::Transport(format!(
                "data channel '{}' not open: {state:?}",
                self.label
            )));
        }
        match msg {
            ChannelMessage::Text(text) => self.dc.send_text(text).await?,
            ChannelMessage::Binary(data) => self.dc.send(&data).await?,
        };
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            warn!(event = "dc_close_failure", channel = %self.label, error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(map_connection_state(RTCPeerConnectionState::New), ConnectionState::New);
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Disconnected
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(map_connection_state(RTCPeerConnectionState::Closed), ConnectionState::Closed);
    }

    #[test]
    fn test_channel_state_mapping() {
        assert_eq!(map_channel_state(RTCDataChannelState::Open), ChannelState::Open);
        assert_eq!(map_channel_state(RTCDataChannelState::Closing), ChannelState::Closed);
        assert_eq!(map_channel_state(RTCDataChannelState::Connecting), ChannelState::Connecting);
    }

    #[test]
    fn test_candidate_conversion() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let init: RTCIceCandidateInit = c.clone().into();
        assert_eq!(IceCandidate::from(init), c);
    }

    #[test]
    fn test_factory_uses_configured_ice_servers() {
        let factory = WebRtcFactory::new(&TransferConfig::default());
        assert_eq!(factory.ice_servers.len(), 3);
        assert_eq!(factory.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(!factory.include_loopback);
    }
}
