//! Duplex WebSocket transport.
//!
//! A persistent bidirectional connection carrying JSON envelopes. Connect
//! performs a versioned init/init_ack handshake, then runs three loops for
//! the lifetime of the connection: a send loop draining the outbound queue,
//! a receive loop demultiplexing transcript/error/metrics envelopes, and a
//! ping loop sampling round-trip time into a bounded rolling window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::base::{
    StreamingTransport, TranscriptCallback, TranscriptEvent, TransportError, TransportKind,
};
use crate::core::metrics::{ConnectionMetrics, RttWindow};

/// How often the ping loop issues a protocol-level ping.
const PING_INTERVAL: Duration = Duration::from_secs(2);
/// How long an outstanding ping may wait for its pong before it counts as lost.
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Number of RTT samples retained for the latency estimate.
const RTT_WINDOW_SIZE: usize = 10;

/// Configuration for the socket transport.
#[derive(Debug, Clone)]
pub struct SocketTransportConfig {
    /// WebSocket endpoint, e.g. `wss://stream.example.com/v1/listen`.
    pub url: String,
    /// Session identifier sent in the init handshake.
    pub session_id: String,
    /// Sample rate of the audio in Hz.
    pub sample_rate: u32,
    /// Number of audio channels.
    pub channels: u16,
    /// Encoding of the audio (e.g. "linear16").
    pub encoding: String,
    /// Bounded wait for the init_ack response (ms).
    pub handshake_timeout_ms: u64,
}

/// Audio format block inside the init envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitAudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: String,
    pub streaming: bool,
}

/// Client-to-server envelopes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Init {
        session_id: String,
        config: InitAudioConfig,
    },
    Audio {
        data: String,
        timestamp: f64,
        seq: u64,
    },
}

/// Server-to-client envelopes.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    InitAck,
    Transcript {
        partial: String,
        is_final: bool,
        confidence: f32,
        timestamp: f64,
    },
    Error {
        message: String,
    },
    Metrics {
        bandwidth_kbps: f64,
        jitter_ms: f64,
    },
}

/// Bandwidth/jitter figures reported by the remote peer.
#[derive(Debug, Default, Clone, Copy)]
struct RemoteLinkStats {
    bandwidth_kbps: f64,
    jitter_ms: f64,
}

/// Link statistics shared between the loops and `metrics()`.
struct LinkState {
    rtt_window: Mutex<RttWindow>,
    pending_pings: Mutex<HashMap<u64, Instant>>,
    packets_sent: AtomicU64,
    packets_lost: AtomicU64,
    remote: Mutex<RemoteLinkStats>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            rtt_window: Mutex::new(RttWindow::new(RTT_WINDOW_SIZE)),
            pending_pings: Mutex::new(HashMap::new()),
            packets_sent: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            remote: Mutex::new(RemoteLinkStats::default()),
        }
    }

    fn record_pong(&self, seq: u64) {
        let started = self.pending_pings.lock().remove(&seq);
        if let Some(started) = started {
            let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.rtt_window.lock().push(rtt_ms);
            debug!("Ping {} round trip: {:.1}ms", seq, rtt_ms);
        }
    }

    /// Expire outstanding pings older than the timeout, counting each as loss.
    fn expire_pings(&self) {
        let mut pending = self.pending_pings.lock();
        let before = pending.len();
        pending.retain(|_, started| started.elapsed() < PING_TIMEOUT);
        let expired = before - pending.len();
        if expired > 0 {
            self.packets_lost
                .fetch_add(expired as u64, Ordering::Relaxed);
            warn!("{} ping(s) timed out, counted as loss", expired);
        }
    }

    fn loss_rate(&self) -> f64 {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        self.packets_lost.load(Ordering::Relaxed) as f64 / sent as f64
    }

    fn snapshot(&self) -> ConnectionMetrics {
        let remote = *self.remote.lock();
        let mut metrics = ConnectionMetrics::default();
        metrics.update(
            self.rtt_window.lock().mean(),
            self.loss_rate(),
            remote.jitter_ms,
            remote.bandwidth_kbps,
        );
        metrics
    }
}

/// Duplex WebSocket transport with a JSON wire protocol.
pub struct SocketTransport {
    config: SocketTransportConfig,
    /// Outbound queue drained by the send loop. FIFO per session.
    outbound_tx: Option<mpsc::UnboundedSender<Message>>,
    /// Shutdown signal fanned out to all three loops.
    shutdown_tx: Option<broadcast::Sender<()>>,
    transcript_callback: Arc<SyncRwLock<Option<TranscriptCallback>>>,
    link: Arc<LinkState>,
    audio_seq: AtomicU64,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SocketTransport {
    pub fn new(config: SocketTransportConfig) -> Result<Self, TransportError> {
        if config.url.is_empty() {
            return Err(TransportError::ConfigurationError(
                "socket transport requires a url".to_string(),
            ));
        }
        url::Url::parse(&config.url)
            .map_err(|e| TransportError::ConfigurationError(format!("invalid socket url: {e}")))?;

        Ok(Self {
            config,
            outbound_tx: None,
            shutdown_tx: None,
            transcript_callback: Arc::new(SyncRwLock::new(None)),
            link: Arc::new(LinkState::new()),
            audio_seq: AtomicU64::new(0),
            tasks: Vec::new(),
        })
    }

    /// Perform the init/init_ack handshake on a fresh stream.
    async fn handshake<S>(&self, ws: &mut S) -> Result<(), TransportError>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + futures::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let init = ClientMessage::Init {
            session_id: self.config.session_id.clone(),
            config: InitAudioConfig {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                encoding: self.config.encoding.clone(),
                streaming: true,
            },
        };
        let payload = serde_json::to_string(&init)
            .map_err(|e| TransportError::ConnectFailed(format!("failed to encode init: {e}")))?;
        ws.send(Message::Text(payload.into()))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("failed to send init: {e}")))?;

        let wait = Duration::from_millis(self.config.handshake_timeout_ms);
        let response = timeout(wait, ws.next())
            .await
            .map_err(|_| TransportError::ConnectFailed("handshake timed out".to_string()))?;

        match response {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::InitAck) => Ok(()),
                Ok(other) => Err(TransportError::HandshakeRejected(format!(
                    "expected init_ack, got {other:?}"
                ))),
                Err(e) => Err(TransportError::HandshakeRejected(format!(
                    "unparseable handshake response: {e}"
                ))),
            },
            Some(Ok(other)) => Err(TransportError::HandshakeRejected(format!(
                "expected init_ack text frame, got {other:?}"
            ))),
            Some(Err(e)) => Err(TransportError::ConnectFailed(format!(
                "socket error during handshake: {e}"
            ))),
            None => Err(TransportError::ConnectFailed(
                "socket closed during handshake".to_string(),
            )),
        }
    }

    /// Dispatch one received frame from the receive loop.
    async fn handle_frame(
        message: Message,
        link: &LinkState,
        callback: &SyncRwLock<Option<TranscriptCallback>>,
    ) {
        match message {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Transcript {
                    partial,
                    is_final,
                    confidence,
                    timestamp,
                }) => {
                    let event = TranscriptEvent::new(
                        partial,
                        is_final,
                        confidence,
                        (timestamp * 1000.0) as u64,
                    );
                    let callback = callback.read().clone();
                    if let Some(callback) = callback {
                        callback(event).await;
                    }
                }
                Ok(ServerMessage::Error { message }) => {
                    warn!("Remote stream error: {}", message);
                }
                Ok(ServerMessage::Metrics {
                    bandwidth_kbps,
                    jitter_ms,
                }) => {
                    let mut remote = link.remote.lock();
                    remote.bandwidth_kbps = bandwidth_kbps;
                    remote.jitter_ms = jitter_ms;
                }
                Ok(ServerMessage::InitAck) => {
                    debug!("Ignoring duplicate init_ack");
                }
                Err(e) => {
                    warn!("Unparseable frame from server: {}", e);
                }
            },
            Message::Pong(data) => {
                if let Ok(bytes) = <[u8; 8]>::try_from(data.as_ref()) {
                    link.record_pong(u64::from_be_bytes(bytes));
                } else {
                    debug!("Pong with unexpected payload length {}", data.len());
                }
            }
            Message::Ping(_) => {
                // Pong reply is handled by the WebSocket library.
            }
            Message::Binary(data) => {
                warn!("Unexpected binary frame of {} bytes", data.len());
            }
            Message::Close(frame) => {
                info!("Socket closed by peer: {:?}", frame);
            }
            Message::Frame(_) => {}
        }
    }
}

#[async_trait::async_trait]
impl StreamingTransport for SocketTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_ready() {
            return Ok(());
        }

        let (mut ws_stream, _) = connect_async(&self.config.url)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("socket connect: {e}")))?;

        self.handshake(&mut ws_stream).await?;
        info!(
            session_id = %self.config.session_id,
            "Socket transport connected to {}", self.config.url
        );

        let (ws_sink, ws_source) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // Send loop: drains the outbound queue into the sink.
        let mut shutdown_rx = shutdown_tx.subscribe();
        let send_task = tokio::spawn(async move {
            let mut ws_sink = ws_sink;
            let mut outbound_rx = outbound_rx;
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = ws_sink.send(message).await {
                            error!("Socket send failed: {}", e);
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            let _ = ws_sink.close().await;
            debug!("Socket send loop stopped");
        });

        // Receive loop: demultiplexes transcript/error/metrics envelopes.
        let link = self.link.clone();
        let callback = self.transcript_callback.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let recv_task = tokio::spawn(async move {
            let mut ws_source = ws_source;
            loop {
                tokio::select! {
                    message = ws_source.next() => {
                        match message {
                            Some(Ok(msg)) => {
                                Self::handle_frame(msg, &link, &callback).await;
                            }
                            Some(Err(e)) => {
                                error!("Socket receive error: {}", e);
                                break;
                            }
                            None => {
                                info!("Socket stream ended");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Socket receive loop stopped");
        });

        // Ping loop: samples RTT every 2 seconds; a timed-out ping counts as
        // a loss sample, not a connection failure.
        let link = self.link.clone();
        let ping_tx = outbound_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            let mut ping_seq: u64 = 0;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        link.expire_pings();
                        ping_seq += 1;
                        link.pending_pings.lock().insert(ping_seq, Instant::now());
                        link.packets_sent.fetch_add(1, Ordering::Relaxed);
                        let payload = ping_seq.to_be_bytes().to_vec();
                        if ping_tx.send(Message::Ping(payload.into())).is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Socket ping loop stopped");
        });

        self.outbound_tx = Some(outbound_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.tasks = vec![send_task, recv_task, ping_task];
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            // Already disconnected.
            return Ok(());
        };
        let _ = shutdown_tx.send(());

        // Releasing the queue unblocks the send loop even if no shutdown
        // subscriber was polled yet.
        self.outbound_tx = None;

        for task in self.tasks.drain(..) {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Socket loop did not stop within 5s");
            }
        }

        info!(
            session_id = %self.config.session_id,
            "Socket transport disconnected"
        );
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.outbound_tx.is_some()
    }

    async fn send_audio(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let Some(outbound_tx) = &self.outbound_tx else {
            return Err(TransportError::NotConnected(
                "socket transport is not connected".to_string(),
            ));
        };

        let seq = self.audio_seq.fetch_add(1, Ordering::Relaxed);
        let message = ClientMessage::Audio {
            data: BASE64.encode(chunk),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            seq,
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| TransportError::SendFailed(format!("failed to encode audio: {e}")))?;

        outbound_tx
            .send(Message::Text(payload.into()))
            .map_err(|e| TransportError::SendFailed(format!("outbound queue closed: {e}")))?;
        self.link.packets_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Queued audio chunk seq={} ({} bytes)", seq, chunk.len());
        Ok(())
    }

    async fn on_transcript(&mut self, callback: TranscriptCallback) -> Result<(), TransportError> {
        *self.transcript_callback.write() = Some(callback);
        Ok(())
    }

    fn metrics(&self) -> ConnectionMetrics {
        self.link.snapshot()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::ConnectionQuality;

    fn test_config() -> SocketTransportConfig {
        SocketTransportConfig {
            url: "wss://stream.example.com/v1/listen".to_string(),
            session_id: "session-1".to_string(),
            sample_rate: 16000,
            channels: 1,
            encoding: "linear16".to_string(),
            handshake_timeout_ms: 5000,
        }
    }

    #[test]
    fn test_rejects_empty_url() {
        let config = SocketTransportConfig {
            url: String::new(),
            ..test_config()
        };
        assert!(matches!(
            SocketTransport::new(config),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_init_envelope_shape() {
        let init = ClientMessage::Init {
            session_id: "session-1".to_string(),
            config: InitAudioConfig {
                sample_rate: 16000,
                channels: 1,
                encoding: "linear16".to_string(),
                streaming: true,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&init).unwrap()).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["session_id"], "session-1");
        assert_eq!(json["config"]["sample_rate"], 16000);
        assert_eq!(json["config"]["encoding"], "linear16");
        assert_eq!(json["config"]["streaming"], true);
    }

    #[test]
    fn test_audio_envelope_shape() {
        let audio = ClientMessage::Audio {
            data: BASE64.encode(b"pcm"),
            timestamp: 12.5,
            seq: 7,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&audio).unwrap()).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["timestamp"], 12.5);
        assert_eq!(
            BASE64.decode(json["data"].as_str().unwrap()).unwrap(),
            b"pcm"
        );
    }

    #[test]
    fn test_server_envelope_parsing() {
        let transcript: ServerMessage = serde_json::from_str(
            r#"{"type":"transcript","partial":"hello there","is_final":false,"confidence":0.92,"timestamp":3.25}"#,
        )
        .unwrap();
        match transcript {
            ServerMessage::Transcript {
                partial,
                is_final,
                confidence,
                timestamp,
            } => {
                assert_eq!(partial, "hello there");
                assert!(!is_final);
                assert_eq!(confidence, 0.92);
                assert_eq!(timestamp, 3.25);
            }
            other => panic!("expected transcript, got {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ServerMessage>(r#"{"type":"init_ack"}"#).unwrap(),
            ServerMessage::InitAck
        ));
        assert!(matches!(
            serde_json::from_str::<ServerMessage>(
                r#"{"type":"metrics","bandwidth_kbps":256.0,"jitter_ms":4.0}"#
            )
            .unwrap(),
            ServerMessage::Metrics { .. }
        ));
    }

    #[tokio::test]
    async fn test_transcript_frame_invokes_callback() {
        use std::sync::atomic::AtomicUsize;

        let link = LinkState::new();
        let received = Arc::new(SyncRwLock::new(None::<TranscriptEvent>));
        let calls = Arc::new(AtomicUsize::new(0));

        let received_clone = received.clone();
        let calls_clone = calls.clone();
        let callback: TranscriptCallback = Arc::new(move |event| {
            let received = received_clone.clone();
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                *received.write() = Some(event);
            })
        });
        let holder = SyncRwLock::new(Some(callback));

        let frame = Message::Text(
            r#"{"type":"transcript","partial":"hi","is_final":true,"confidence":0.8,"timestamp":1.0}"#
                .to_string()
                .into(),
        );
        SocketTransport::handle_frame(frame, &link, &holder).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let event = received.read().clone().unwrap();
        assert_eq!(event.partial, "hi");
        assert!(event.is_final);
        assert_eq!(event.timestamp_ms, 1000);
    }

    #[tokio::test]
    async fn test_metrics_frame_updates_remote_stats() {
        let link = LinkState::new();
        let holder = SyncRwLock::new(None);
        let frame = Message::Text(
            r#"{"type":"metrics","bandwidth_kbps":512.0,"jitter_ms":6.5}"#
                .to_string()
                .into(),
        );
        SocketTransport::handle_frame(frame, &link, &holder).await;

        let metrics = link.snapshot();
        assert_eq!(metrics.bandwidth_kbps, 512.0);
        assert_eq!(metrics.jitter_ms, 6.5);
    }

    #[test]
    fn test_latency_is_mean_of_last_ten_samples() {
        let transport = SocketTransport::new(test_config()).unwrap();
        for i in 1..=15 {
            transport.link.rtt_window.lock().push(i as f64 * 10.0);
        }
        // Samples 60..=150 remain; their mean is 105ms.
        let metrics = transport.metrics();
        assert!((metrics.latency_ms - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ping_timeout_counts_as_loss() {
        let link = LinkState::new();
        link.packets_sent.store(10, Ordering::Relaxed);
        link.pending_pings
            .lock()
            .insert(1, Instant::now() - PING_TIMEOUT - Duration::from_millis(1));
        link.expire_pings();

        assert_eq!(link.packets_lost.load(Ordering::Relaxed), 1);
        assert!((link.loss_rate() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pong_resolves_pending_ping() {
        let link = LinkState::new();
        link.pending_pings.lock().insert(3, Instant::now());
        link.record_pong(3);

        assert!(link.pending_pings.lock().is_empty());
        assert_eq!(link.rtt_window.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut transport = SocketTransport::new(test_config()).unwrap();
        assert!(!transport.is_ready());
        // Never connected: both calls are no-ops.
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_audio_requires_connection() {
        let mut transport = SocketTransport::new(test_config()).unwrap();
        let result = transport.send_audio(&[0u8; 320]).await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
    }

    #[test]
    fn test_quality_degrades_with_lost_pings() {
        let transport = SocketTransport::new(test_config()).unwrap();
        transport.link.rtt_window.lock().push(30.0);
        transport.link.packets_sent.store(100, Ordering::Relaxed);
        transport.link.packets_lost.store(10, Ordering::Relaxed);

        let metrics = transport.metrics();
        assert_eq!(metrics.quality, ConnectionQuality::Critical);
    }
}
