//! Peer-to-peer data-channel transport.
//!
//! Audio rides an unordered, no-retransmit data channel negotiated via
//! ICE/STUN: ordering and retransmission add latency that exceeds the value
//! of a lost 250ms audio frame. Frames use a minimal binary layout (1-byte
//! type, 8-byte big-endian millisecond timestamp, payload) instead of a JSON
//! envelope; a JSON text frame is still accepted for out-of-band config and
//! metrics exchange. Offer/answer descriptions are swapped with a signaling
//! endpoint over a plain HTTP request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::base::{
    epoch_millis, StreamingTransport, TranscriptCallback, TranscriptEvent, TransportError,
    TransportKind,
};
use crate::core::metrics::{ConnectionMetrics, ConnectionQuality};

/// Binary frame type tags.
const FRAME_AUDIO: u8 = 1;
const FRAME_TRANSCRIPT: u8 = 2;

/// Header: 1-byte type + 8-byte big-endian millisecond timestamp.
const FRAME_HEADER_LEN: usize = 9;

/// Stats poll cadence (~1 Hz).
const STATS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// TURN relay credentials, used when STUN alone cannot find a path.
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Configuration for the data-channel transport.
#[derive(Debug, Clone)]
pub struct RtcTransportConfig {
    /// Signaling endpoint base, e.g. `https://signal.example.com`.
    pub signaling_url: String,
    /// Session identifier included in the offer exchange.
    pub session_id: String,
    /// STUN server URLs, e.g. `stun:stun.l.google.com:19302`.
    pub stun_servers: Vec<String>,
    /// Optional TURN relay.
    pub turn_server: Option<TurnServerConfig>,
}

/// Offer sent to the signaling endpoint.
#[derive(Debug, Serialize)]
struct SignalingOffer {
    session_id: String,
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: String,
}

/// Answer returned by the signaling endpoint.
#[derive(Debug, Deserialize)]
struct SignalingAnswer {
    sdp: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    sdp_type: String,
}

/// Out-of-band config frame sent as JSON text when the channel opens.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChannelMessage {
    Config {
        session_id: String,
        encoding: String,
    },
}

/// Encode an audio frame: `type | timestamp_ms (be) | raw payload`.
fn encode_audio_frame(timestamp_ms: u64, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(FRAME_AUDIO);
    frame.extend_from_slice(&timestamp_ms.to_be_bytes());
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// Decode a transcript frame: `type | timestamp_ms (be) | is_final | utf8 text`.
fn decode_transcript_frame(data: &[u8]) -> Option<(u64, bool, String)> {
    if data.len() < FRAME_HEADER_LEN + 1 || data[0] != FRAME_TRANSCRIPT {
        return None;
    }
    let timestamp_ms = u64::from_be_bytes(data[1..FRAME_HEADER_LEN].try_into().ok()?);
    let is_final = data[FRAME_HEADER_LEN] != 0;
    let text = String::from_utf8(data[FRAME_HEADER_LEN + 1..].to_vec()).ok()?;
    Some((timestamp_ms, is_final, text))
}

/// Link statistics shared between the handlers, the stats loop and `metrics()`.
struct RtcLinkState {
    metrics: Mutex<ConnectionMetrics>,
    /// Previous RTT sample used for the jitter estimate.
    last_rtt_ms: Mutex<Option<f64>>,
    frames_sent: AtomicU64,
    frames_failed: AtomicU64,
}

impl RtcLinkState {
    fn new() -> Self {
        Self {
            metrics: Mutex::new(ConnectionMetrics::default()),
            last_rtt_ms: Mutex::new(None),
            frames_sent: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
        }
    }

    /// Feed one native stats sample into the metrics.
    fn record_stats_sample(&self, rtt_ms: f64, bandwidth_kbps: f64) {
        let jitter_ms = {
            let mut last = self.last_rtt_ms.lock();
            let jitter = last.map(|prev| (rtt_ms - prev).abs()).unwrap_or(0.0);
            *last = Some(rtt_ms);
            jitter
        };

        let sent = self.frames_sent.load(Ordering::Relaxed);
        let failed = self.frames_failed.load(Ordering::Relaxed);
        let loss = if sent == 0 {
            0.0
        } else {
            failed as f64 / sent as f64
        };

        self.metrics
            .lock()
            .update(rtt_ms, loss, jitter_ms, bandwidth_kbps);
    }

    /// Record an observed one-way latency from an embedded frame timestamp.
    fn record_frame_latency(&self, latency_ms: f64) {
        let mut metrics = self.metrics.lock();
        let (loss, jitter, bandwidth) = (
            metrics.packet_loss,
            metrics.jitter_ms,
            metrics.bandwidth_kbps,
        );
        metrics.update(latency_ms, loss, jitter, bandwidth);
    }
}

/// Peer-to-peer data-channel transport.
pub struct RtcTransport {
    config: RtcTransportConfig,
    peer: Option<Arc<RTCPeerConnection>>,
    channel: Option<Arc<RTCDataChannel>>,
    transcript_callback: Arc<SyncRwLock<Option<TranscriptCallback>>>,
    link: Arc<RtcLinkState>,
    http: reqwest::Client,
    shutdown_tx: Option<broadcast::Sender<()>>,
    stats_task: Option<tokio::task::JoinHandle<()>>,
}

impl RtcTransport {
    pub fn new(config: RtcTransportConfig) -> Result<Self, TransportError> {
        if config.signaling_url.is_empty() {
            return Err(TransportError::ConfigurationError(
                "rtc transport requires a signaling url".to_string(),
            ));
        }
        if config.stun_servers.is_empty() {
            return Err(TransportError::ConfigurationError(
                "rtc transport requires at least one STUN server".to_string(),
            ));
        }

        Ok(Self {
            config,
            peer: None,
            channel: None,
            transcript_callback: Arc::new(SyncRwLock::new(None)),
            link: Arc::new(RtcLinkState::new()),
            http: reqwest::Client::new(),
            shutdown_tx: None,
            stats_task: None,
        })
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: self.config.stun_servers.clone(),
            ..Default::default()
        }];
        if let Some(turn) = &self.config.turn_server {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    /// Exchange offer/answer with the signaling endpoint.
    async fn exchange_descriptions(
        &self,
        offer: &RTCSessionDescription,
    ) -> Result<RTCSessionDescription, TransportError> {
        let url = format!(
            "{}/rtc/offer",
            self.config.signaling_url.trim_end_matches('/')
        );
        let body = SignalingOffer {
            session_id: self.config.session_id.clone(),
            sdp: offer.sdp.clone(),
            sdp_type: offer.sdp_type.to_string(),
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("offer exchange: {e}")))?;

        if !response.status().is_success() {
            return Err(TransportError::SignalingFailed(format!(
                "signaling endpoint returned {}",
                response.status()
            )));
        }

        let answer: SignalingAnswer = response
            .json()
            .await
            .map_err(|e| TransportError::SignalingFailed(format!("unparseable answer: {e}")))?;

        RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| TransportError::SignalingFailed(format!("invalid answer sdp: {e}")))
    }

    /// Handle one received data-channel message.
    async fn handle_channel_message(
        msg: DataChannelMessage,
        link: &RtcLinkState,
        callback: &SyncRwLock<Option<TranscriptCallback>>,
    ) {
        if msg.is_string {
            match serde_json::from_slice::<ChannelMessage>(&msg.data) {
                Ok(ChannelMessage::Config { session_id, .. }) => {
                    debug!("Channel config frame for session {}", session_id);
                }
                Err(e) => warn!("Unparseable text frame on data channel: {}", e),
            }
            return;
        }

        let Some((timestamp_ms, is_final, text)) = decode_transcript_frame(&msg.data) else {
            debug!("Ignoring non-transcript frame of {} bytes", msg.data.len());
            return;
        };

        let latency_ms = epoch_millis().saturating_sub(timestamp_ms) as f64;
        link.record_frame_latency(latency_ms);

        // Confidence is not carried in the binary framing; the receive path
        // reports full confidence and leaves scoring to the detector.
        let event = TranscriptEvent::new(text, is_final, 1.0, timestamp_ms);
        let callback = callback.read().clone();
        if let Some(callback) = callback {
            callback(event).await;
        }
    }

    fn coarse_quality_for_state(state: RTCPeerConnectionState) -> Option<ConnectionQuality> {
        match state {
            RTCPeerConnectionState::Connected => Some(ConnectionQuality::Excellent),
            RTCPeerConnectionState::Connecting => Some(ConnectionQuality::Good),
            RTCPeerConnectionState::Disconnected => Some(ConnectionQuality::Poor),
            RTCPeerConnectionState::Failed => Some(ConnectionQuality::Critical),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl StreamingTransport for RtcTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_ready() {
            return Ok(());
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectFailed(format!("media engine: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::ConnectFailed(format!("interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::ConnectFailed(format!("peer connection: {e}")))?,
        );

        // Unordered with zero retransmits: stale audio has negative value.
        let channel_init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let channel = peer
            .create_data_channel("audio", Some(channel_init))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("data channel: {e}")))?;

        let link = self.link.clone();
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let link = link.clone();
            Box::pin(async move {
                info!("Peer connection state: {}", state);
                if let Some(quality) = Self::coarse_quality_for_state(state) {
                    link.metrics.lock().set_coarse_quality(quality);
                }
            })
        }));

        let link = self.link.clone();
        let callback = self.transcript_callback.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let link = link.clone();
            let callback = callback.clone();
            Box::pin(async move {
                Self::handle_channel_message(msg, &link, &callback).await;
            })
        }));

        let open_channel = channel.clone();
        let session_id = self.config.session_id.clone();
        channel.on_open(Box::new(move || {
            let channel = open_channel.clone();
            Box::pin(async move {
                let config = ChannelMessage::Config {
                    session_id,
                    encoding: "linear16".to_string(),
                };
                match serde_json::to_string(&config) {
                    Ok(text) => {
                        if let Err(e) = channel.send_text(text).await {
                            warn!("Failed to send channel config: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode channel config: {}", e),
                }
            })
        }));

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("create offer: {e}")))?;
        let mut gather_complete = peer.gathering_complete_promise().await;
        peer.set_local_description(offer)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("local description: {e}")))?;
        let _ = gather_complete.recv().await;

        let local_description = peer.local_description().await.ok_or_else(|| {
            TransportError::ConnectFailed("no local description after gathering".to_string())
        })?;
        let answer = self.exchange_descriptions(&local_description).await?;
        peer.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("remote description: {e}")))?;

        // Native stats poll at ~1 Hz: RTT and available bitrate from the
        // nominated candidate pair.
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let stats_peer = peer.clone();
        let link = self.link.clone();
        let stats_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = stats_peer.get_stats().await;
                        for stat in report.reports.values() {
                            if let StatsReportType::CandidatePair(pair) = stat {
                                if !pair.nominated {
                                    continue;
                                }
                                let rtt_ms = pair.current_round_trip_time * 1000.0;
                                let bandwidth_kbps = pair.available_outgoing_bitrate as f64 / 1000.0;
                                if rtt_ms > 0.0 {
                                    link.record_stats_sample(rtt_ms, bandwidth_kbps);
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Rtc stats loop stopped");
        });

        info!(
            session_id = %self.config.session_id,
            "Rtc transport connected via {}", self.config.signaling_url
        );
        self.peer = Some(peer);
        self.channel = Some(channel);
        self.shutdown_tx = Some(shutdown_tx);
        self.stats_task = Some(stats_task);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        let _ = shutdown_tx.send(());

        if let Some(task) = self.stats_task.take() {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Rtc stats loop did not stop within 5s");
            }
        }

        self.channel = None;
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }

        info!(
            session_id = %self.config.session_id,
            "Rtc transport disconnected"
        );
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.channel.is_some()
    }

    async fn send_audio(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let Some(channel) = &self.channel else {
            return Err(TransportError::NotConnected(
                "data channel is not open".to_string(),
            ));
        };

        let frame = encode_audio_frame(epoch_millis(), chunk);
        self.link.frames_sent.fetch_add(1, Ordering::Relaxed);
        match channel.send(&frame).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.link.frames_failed.fetch_add(1, Ordering::Relaxed);
                error!("Data channel send failed: {}", e);
                Err(TransportError::SendFailed(format!("data channel: {e}")))
            }
        }
    }

    async fn on_transcript(&mut self, callback: TranscriptCallback) -> Result<(), TransportError> {
        *self.transcript_callback.write() = Some(callback);
        Ok(())
    }

    fn metrics(&self) -> ConnectionMetrics {
        self.link.metrics.lock().clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RtcTransportConfig {
        RtcTransportConfig {
            signaling_url: "https://signal.example.com".to_string(),
            session_id: "session-1".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_server: None,
        }
    }

    #[test]
    fn test_rejects_missing_stun_servers() {
        let config = RtcTransportConfig {
            stun_servers: Vec::new(),
            ..test_config()
        };
        assert!(matches!(
            RtcTransport::new(config),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_audio_frame_layout() {
        let frame = encode_audio_frame(0x0102030405060708, &[0xAA, 0xBB]);
        assert_eq!(frame[0], FRAME_AUDIO);
        assert_eq!(&frame[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&frame[9..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_transcript_frame_decoding() {
        let mut frame = vec![FRAME_TRANSCRIPT];
        frame.extend_from_slice(&1234u64.to_be_bytes());
        frame.push(1);
        frame.extend_from_slice("done now".as_bytes());

        let (timestamp_ms, is_final, text) = decode_transcript_frame(&frame).unwrap();
        assert_eq!(timestamp_ms, 1234);
        assert!(is_final);
        assert_eq!(text, "done now");
    }

    #[test]
    fn test_transcript_frame_rejects_wrong_type_or_short() {
        // Audio type tag.
        let mut frame = vec![FRAME_AUDIO];
        frame.extend_from_slice(&0u64.to_be_bytes());
        frame.push(0);
        assert!(decode_transcript_frame(&frame).is_none());

        // Truncated header.
        assert!(decode_transcript_frame(&[FRAME_TRANSCRIPT, 0, 0]).is_none());
    }

    #[test]
    fn test_transcript_frame_rejects_invalid_utf8() {
        let mut frame = vec![FRAME_TRANSCRIPT];
        frame.extend_from_slice(&0u64.to_be_bytes());
        frame.push(0);
        frame.extend_from_slice(&[0xFF, 0xFE]);
        assert!(decode_transcript_frame(&frame).is_none());
    }

    #[test]
    fn test_state_to_coarse_quality_mapping() {
        assert_eq!(
            RtcTransport::coarse_quality_for_state(RTCPeerConnectionState::Connected),
            Some(ConnectionQuality::Excellent)
        );
        assert_eq!(
            RtcTransport::coarse_quality_for_state(RTCPeerConnectionState::Connecting),
            Some(ConnectionQuality::Good)
        );
        assert_eq!(
            RtcTransport::coarse_quality_for_state(RTCPeerConnectionState::Failed),
            Some(ConnectionQuality::Critical)
        );
        assert_eq!(
            RtcTransport::coarse_quality_for_state(RTCPeerConnectionState::Closed),
            None
        );
    }

    #[tokio::test]
    async fn test_channel_message_dispatches_transcript() {
        use std::sync::atomic::AtomicUsize;

        let link = RtcLinkState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let seen = Arc::new(SyncRwLock::new(String::new()));
        let seen_clone = seen.clone();

        let callback: TranscriptCallback = Arc::new(move |event: TranscriptEvent| {
            let calls = calls_clone.clone();
            let seen = seen_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.write() = event.partial;
            })
        });
        let holder = SyncRwLock::new(Some(callback));

        let mut data = vec![FRAME_TRANSCRIPT];
        data.extend_from_slice(&epoch_millis().to_be_bytes());
        data.push(0);
        data.extend_from_slice("partial words".as_bytes());

        let msg = DataChannelMessage {
            is_string: false,
            data: Bytes::from(data),
        };
        RtcTransport::handle_channel_message(msg, &link, &holder).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.read(), "partial words");
    }

    #[test]
    fn test_stats_sample_jitter_from_rtt_delta() {
        let link = RtcLinkState::new();
        link.record_stats_sample(40.0, 800.0);
        link.record_stats_sample(55.0, 800.0);

        let metrics = link.metrics.lock().clone();
        assert_eq!(metrics.latency_ms, 55.0);
        assert_eq!(metrics.jitter_ms, 15.0);
        assert_eq!(metrics.bandwidth_kbps, 800.0);
    }

    #[test]
    fn test_send_failures_feed_loss_rate() {
        let link = RtcLinkState::new();
        link.frames_sent.store(50, Ordering::Relaxed);
        link.frames_failed.store(2, Ordering::Relaxed);
        link.record_stats_sample(30.0, 500.0);

        let metrics = link.metrics.lock().clone();
        assert!((metrics.packet_loss - 0.04).abs() < 1e-9);
        assert_eq!(metrics.quality, ConnectionQuality::Poor);
    }
}
