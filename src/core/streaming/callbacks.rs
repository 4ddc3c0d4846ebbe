//! Callback types and event dispatch for the streaming manager.
//!
//! Events for one session are emitted inline from the task that produced
//! them, so callbacks for the same session always observe events in the
//! chronological order of the underlying transcripts. No ordering holds
//! across sessions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;

use crate::core::metrics::{ConnectionMetrics, ConnectionQuality};

/// An in-progress transcript for an open utterance.
#[derive(Debug, Clone)]
pub struct PartialTranscript {
    pub session_id: String,
    pub transcript: String,
    pub confidence: f32,
    pub timestamp_ms: u64,
}

/// A finalized utterance transcript.
#[derive(Debug, Clone)]
pub struct FinalTranscript {
    pub session_id: String,
    pub transcript: String,
    pub timestamp_ms: u64,
}

/// A terminal session error, fired when all transports are exhausted.
#[derive(Debug, Clone)]
pub struct SessionError {
    pub session_id: String,
    pub message: String,
}

/// A quality-tier transition observed by the monitoring loop.
#[derive(Debug, Clone)]
pub struct QualityChange {
    pub session_id: String,
    pub previous: ConnectionQuality,
    pub current: ConnectionQuality,
    pub metrics: ConnectionMetrics,
}

/// Callback type for partial transcripts
pub type PartialCallback =
    Arc<dyn Fn(PartialTranscript) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for finalized transcripts
pub type FinalCallback =
    Arc<dyn Fn(FinalTranscript) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for terminal session errors
pub type ErrorCallback =
    Arc<dyn Fn(SessionError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for quality transitions
pub type QualityCallback =
    Arc<dyn Fn(QualityChange) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registered callback lists for the four event types.
#[derive(Default)]
pub struct EventDispatcher {
    on_partial: SyncRwLock<Vec<PartialCallback>>,
    on_final: SyncRwLock<Vec<FinalCallback>>,
    on_error: SyncRwLock<Vec<ErrorCallback>>,
    on_quality_change: SyncRwLock<Vec<QualityCallback>>,
}

impl EventDispatcher {
    pub fn register_partial(&self, callback: PartialCallback) {
        self.on_partial.write().push(callback);
    }

    pub fn register_final(&self, callback: FinalCallback) {
        self.on_final.write().push(callback);
    }

    pub fn register_error(&self, callback: ErrorCallback) {
        self.on_error.write().push(callback);
    }

    pub fn register_quality_change(&self, callback: QualityCallback) {
        self.on_quality_change.write().push(callback);
    }

    pub async fn emit_partial(&self, event: PartialTranscript) {
        let callbacks = self.on_partial.read().clone();
        for callback in callbacks {
            callback(event.clone()).await;
        }
    }

    pub async fn emit_final(&self, event: FinalTranscript) {
        let callbacks = self.on_final.read().clone();
        for callback in callbacks {
            callback(event.clone()).await;
        }
    }

    pub async fn emit_error(&self, event: SessionError) {
        let callbacks = self.on_error.read().clone();
        for callback in callbacks {
            callback(event.clone()).await;
        }
    }

    pub async fn emit_quality_change(&self, event: QualityChange) {
        let callbacks = self.on_quality_change.read().clone();
        for callback in callbacks {
            callback(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_all_registered_callbacks() {
        let dispatcher = EventDispatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            dispatcher.register_final(Arc::new(move |_event| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        dispatcher
            .emit_final(FinalTranscript {
                session_id: "s-1".to_string(),
                transcript: "done".to_string(),
                timestamp_ms: 0,
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_emit_without_callbacks_is_noop() {
        let dispatcher = EventDispatcher::default();
        dispatcher
            .emit_error(SessionError {
                session_id: "s-1".to_string(),
                message: "boom".to_string(),
            })
            .await;
    }
}
