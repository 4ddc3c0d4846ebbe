//! Capability interface implemented by the concrete streaming transports.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::metrics::ConnectionMetrics;

/// Which concrete transport a session is riding on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent duplex WebSocket connection with JSON envelopes.
    Socket,
    /// Peer-to-peer data channel negotiated via ICE/STUN.
    WebRtc,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::WebRtc => "webrtc",
        }
    }
}

/// Incremental recognition result delivered by a transport's receive path.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// The transcript text so far for the current utterance.
    pub partial: String,
    /// Whether the remote recognizer flagged this result as final.
    pub is_final: bool,
    /// Recognizer confidence in the range 0.0 to 1.0.
    pub confidence: f32,
    /// Remote-side timestamp in epoch milliseconds.
    pub timestamp_ms: u64,
}

impl TranscriptEvent {
    pub fn new(partial: String, is_final: bool, confidence: f32, timestamp_ms: u64) -> Self {
        Self {
            partial,
            is_final,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp_ms,
        }
    }
}

/// Error types for transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("Signaling failed: {0}")]
    SignalingFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Callback type for transcript events emitted by a transport.
pub type TranscriptCallback =
    Arc<dyn Fn(TranscriptEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Capability trait for a session's audio transport.
///
/// Connect starts the transport's background loops; disconnect must cancel
/// them all and await their termination before returning, and must be safe to
/// call repeatedly.
#[async_trait::async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Establish the connection and start the background loops.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether the transport is connected and accepting audio.
    fn is_ready(&self) -> bool;

    /// Forward one audio chunk. Delivery is at-most-once; a failure here is
    /// non-fatal to the session and is handled by the manager's fallback path.
    async fn send_audio(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Register the callback invoked for every received transcript event.
    async fn on_transcript(&mut self, callback: TranscriptCallback) -> Result<(), TransportError>;

    /// Snapshot of the connection's live metrics.
    fn metrics(&self) -> ConnectionMetrics;

    /// Which concrete transport this is.
    fn kind(&self) -> TransportKind;
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_event_confidence_clamping() {
        let event = TranscriptEvent::new("hello".to_string(), false, 1.7, 0);
        assert_eq!(event.confidence, 1.0);

        let event = TranscriptEvent::new("hello".to_string(), false, -0.2, 0);
        assert_eq!(event.confidence, 0.0);
    }

    #[test]
    fn test_transport_kind_labels() {
        assert_eq!(TransportKind::Socket.as_str(), "socket");
        assert_eq!(TransportKind::WebRtc.as_str(), "webrtc");
    }
}
