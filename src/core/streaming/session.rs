//! Per-session state owned by the streaming manager.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio::sync::Mutex;

use crate::core::endpoint::EndpointDetector;
use crate::core::metrics::ConnectionQuality;
use crate::core::transport::{StreamingTransport, TransportKind};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// Terminal: every available transport was exhausted.
    Failed,
}

/// Mutable state for one caller's active voice turn.
///
/// Only the owning manager writes these fields; transport receive loops reach
/// them through the manager-installed transcript callback.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub transport_kind: TransportKind,
    pub status: SessionStatus,
    pub started_at: Instant,
    /// Recent raw chunks, bounded; drained into a fallback transport.
    pub audio_buffer: VecDeque<Vec<u8>>,
    /// Transcript of the open utterance, replaced by each transcript event.
    pub partial_transcript: String,
    /// Finalized utterances for this call, in order.
    pub final_transcripts: Vec<String>,
    pub speaking: bool,
    pub last_speech: Option<Instant>,
    pub last_partial_emit: Option<Instant>,
    pub utterance_start: Option<Instant>,
    pub last_quality: ConnectionQuality,
    /// Latch so a degraded session with no remaining transport warns once
    /// per degraded episode, not on every monitor tick.
    pub fallback_warned: bool,
}

impl SessionState {
    pub fn new(session_id: String, transport_kind: TransportKind) -> Self {
        Self {
            session_id,
            transport_kind,
            status: SessionStatus::Active,
            started_at: Instant::now(),
            audio_buffer: VecDeque::new(),
            partial_transcript: String::new(),
            final_transcripts: Vec::new(),
            speaking: false,
            last_speech: None,
            last_partial_emit: None,
            utterance_start: None,
            last_quality: ConnectionQuality::Good,
            fallback_warned: false,
        }
    }
}

/// Shared handle to one session's state, transport and detector.
pub struct SessionHandle {
    pub state: SyncRwLock<SessionState>,
    pub transport: Mutex<Box<dyn StreamingTransport>>,
    pub detector: SyncMutex<Box<dyn EndpointDetector>>,
}

/// Point-in-time view of a session, returned by `session_stats`.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: String,
    pub duration_ms: u64,
    pub transport_kind: TransportKind,
    pub quality: ConnectionQuality,
    pub latency_ms: f64,
    pub packet_loss: f64,
    pub transcript_count: usize,
    pub buffered_chunks: usize,
}

/// Result of processing one audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    /// The partial transcript so far, or the finalized utterance when
    /// `is_final` is set.
    pub partial_transcript: String,
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_state() {
        let state = SessionState::new("s-1".to_string(), TransportKind::Socket);
        assert_eq!(state.status, SessionStatus::Active);
        assert!(state.audio_buffer.is_empty());
        assert!(state.partial_transcript.is_empty());
        assert!(state.final_transcripts.is_empty());
        assert!(!state.speaking);
        assert!(state.utterance_start.is_none());
    }
}
