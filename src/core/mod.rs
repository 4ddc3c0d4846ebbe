pub mod audio;
pub mod endpoint;
pub mod metrics;
pub mod streaming;
pub mod transport;

// Re-export commonly used types for convenience
pub use audio::{AudioError, AudioProcessor, LinearPcmProcessor, SharedAudioProcessor};
pub use endpoint::{EndpointConfig, EndpointDetector, PredictiveDetector, RuleBasedDetector};
pub use metrics::{ConnectionMetrics, ConnectionQuality};
pub use streaming::{
    ChunkOutcome, FinalTranscript, PartialTranscript, QualityChange, SessionError, SessionStats,
    StreamingConfig, StreamingError, StreamingManager, StreamingResult,
};
pub use transport::{
    RtcTransport, RtcTransportConfig, SocketTransport, SocketTransportConfig, StreamingTransport,
    TranscriptEvent, TransportError, TransportKind, TurnServerConfig,
};
