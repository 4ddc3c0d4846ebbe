//! Error types for streaming manager operations

use crate::core::audio::AudioError;
use crate::core::transport::TransportError;

/// Error types for streaming manager operations
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Duplicate session: {0}")]
    DuplicateSession(String),
    #[error("Session failed: {0}")]
    SessionFailed(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for streaming manager operations
pub type StreamingResult<T> = Result<T, StreamingError>;
