//! Configuration types for the streaming manager.

use crate::core::endpoint::EndpointConfig;
use crate::core::transport::{RtcTransportConfig, SocketTransportConfig, TurnServerConfig};

/// Process-wide tunables for the streaming manager.
///
/// Immutable after manager construction and shared read-only across sessions.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// WebSocket endpoint for the duplex socket transport.
    pub socket_url: String,
    /// Signaling endpoint base for the peer-to-peer transport.
    pub signaling_url: String,
    /// STUN servers for ICE path discovery.
    pub stun_servers: Vec<String>,
    /// Optional TURN relay for networks where STUN fails.
    pub turn_server: Option<TurnServerConfig>,
    /// Whether degraded socket sessions may fall back to the data channel.
    pub enable_webrtc_fallback: bool,
    /// Sample rate of incoming audio in Hz.
    pub sample_rate: u32,
    /// Number of audio channels.
    pub channels: u16,
    /// Encoding of incoming audio.
    pub encoding: String,
    /// Nominal duration of one audio chunk (ms).
    pub chunk_duration_ms: u64,
    /// Minimum interval between partial-transcript callbacks (ms).
    pub partial_interval_ms: u64,
    /// Hard upper bound for any utterance; a finalize is forced beyond it (ms).
    pub max_utterance_ms: u64,
    /// Maximum buffered audio chunks per session; oldest are dropped.
    pub audio_buffer_chunks: usize,
    /// Bounded wait for transport handshakes (ms).
    pub handshake_timeout_ms: u64,
    /// Endpoint detection tunables.
    pub endpoint: EndpointConfig,
    /// Use the predictive detector variant instead of the plain rule-based one.
    pub predictive_endpointing: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            socket_url: String::new(),
            signaling_url: String::new(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_server: None,
            enable_webrtc_fallback: true,
            sample_rate: 16000,
            channels: 1,
            encoding: "linear16".to_string(),
            chunk_duration_ms: 250,
            partial_interval_ms: 200,
            max_utterance_ms: 30_000,
            audio_buffer_chunks: 64,
            handshake_timeout_ms: 5000,
            endpoint: EndpointConfig::default(),
            predictive_endpointing: false,
        }
    }
}

impl StreamingConfig {
    pub fn new(socket_url: impl Into<String>, signaling_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            signaling_url: signaling_url.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint_config(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_webrtc_fallback(mut self, enabled: bool) -> Self {
        self.enable_webrtc_fallback = enabled;
        self
    }

    pub fn with_predictive_endpointing(mut self, enabled: bool) -> Self {
        self.predictive_endpointing = enabled;
        self
    }

    /// Socket transport settings for one session.
    pub fn socket_config(&self, session_id: &str) -> SocketTransportConfig {
        SocketTransportConfig {
            url: self.socket_url.clone(),
            session_id: session_id.to_string(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            encoding: self.encoding.clone(),
            handshake_timeout_ms: self.handshake_timeout_ms,
        }
    }

    /// Data-channel transport settings for one session.
    pub fn rtc_config(&self, session_id: &str) -> RtcTransportConfig {
        RtcTransportConfig {
            signaling_url: self.signaling_url.clone(),
            session_id: session_id.to_string(),
            stun_servers: self.stun_servers.clone(),
            turn_server: self.turn_server.clone(),
        }
    }
}
