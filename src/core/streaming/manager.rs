//! Session orchestration: per-chunk pipeline, quality monitoring, fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::audio::{rms_energy, LinearPcmProcessor, SharedAudioProcessor};
use crate::core::endpoint::{EndpointDetector, PredictiveDetector, RuleBasedDetector};
use crate::core::transport::{
    epoch_millis, RtcTransport, SocketTransport, StreamingTransport, TranscriptCallback,
    TransportError, TransportKind,
};

use super::callbacks::{
    ErrorCallback, EventDispatcher, FinalCallback, FinalTranscript, PartialCallback,
    PartialTranscript, QualityCallback, QualityChange, SessionError,
};
use super::config::StreamingConfig;
use super::errors::{StreamingError, StreamingResult};
use super::session::{ChunkOutcome, SessionHandle, SessionState, SessionStats, SessionStatus};

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Builds an unconnected transport of the requested kind for one session.
pub type TransportFactory = Arc<
    dyn Fn(TransportKind, &StreamingConfig, &str) -> Result<Box<dyn StreamingTransport>, TransportError>
        + Send
        + Sync,
>;

/// Builds a fresh endpoint detector for one session.
pub type DetectorFactory = Arc<dyn Fn(&StreamingConfig) -> Box<dyn EndpointDetector> + Send + Sync>;

fn default_transport_factory() -> TransportFactory {
    Arc::new(|kind, config, session_id| {
        let transport: Box<dyn StreamingTransport> = match kind {
            TransportKind::Socket => Box::new(SocketTransport::new(config.socket_config(session_id))?),
            TransportKind::WebRtc => Box::new(RtcTransport::new(config.rtc_config(session_id))?),
        };
        Ok(transport)
    })
}

fn default_detector_factory() -> DetectorFactory {
    Arc::new(|config| {
        if config.predictive_endpointing {
            Box::new(PredictiveDetector::new(
                config.endpoint.clone(),
                config.sample_rate,
            ))
        } else {
            Box::new(RuleBasedDetector::new(
                config.endpoint.clone(),
                config.sample_rate,
            ))
        }
    })
}

/// Orchestrates all active streaming sessions.
///
/// Owns the session table; every mutation of session state goes through a
/// manager method. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct StreamingManager {
    config: Arc<StreamingConfig>,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    dispatcher: Arc<EventDispatcher>,
    audio_processor: SharedAudioProcessor,
    transport_factory: TransportFactory,
    detector_factory: DetectorFactory,
    monitor_running: Arc<AtomicBool>,
}

impl StreamingManager {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            dispatcher: Arc::new(EventDispatcher::default()),
            audio_processor: Arc::new(LinearPcmProcessor),
            transport_factory: default_transport_factory(),
            detector_factory: default_detector_factory(),
            monitor_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the audio processor. Must be called before sessions start.
    pub fn with_audio_processor(mut self, processor: SharedAudioProcessor) -> Self {
        self.audio_processor = processor;
        self
    }

    /// Replace the transport factory. Used by tests to inject mock transports.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Replace the detector factory.
    pub fn with_detector_factory(mut self, factory: DetectorFactory) -> Self {
        self.detector_factory = factory;
        self
    }

    pub fn on_partial(&self, callback: PartialCallback) {
        self.dispatcher.register_partial(callback);
    }

    pub fn on_final(&self, callback: FinalCallback) {
        self.dispatcher.register_final(callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.dispatcher.register_error(callback);
    }

    pub fn on_quality_change(&self, callback: QualityCallback) {
        self.dispatcher.register_quality_change(callback);
    }

    /// Create, connect and register a session on the given transport.
    ///
    /// Connect-time failures surface synchronously to the caller. The shared
    /// monitoring loop is started with the first session.
    pub async fn start_session(
        &self,
        session_id: &str,
        transport_kind: TransportKind,
    ) -> StreamingResult<()> {
        if self.sessions.read().await.contains_key(session_id) {
            return Err(StreamingError::DuplicateSession(session_id.to_string()));
        }

        let mut transport = (self.transport_factory)(transport_kind, &self.config, session_id)?;
        transport.connect().await?;

        let detector = (self.detector_factory)(&self.config);
        let handle = Arc::new(SessionHandle {
            state: parking_lot::RwLock::new(SessionState::new(
                session_id.to_string(),
                transport_kind,
            )),
            transport: tokio::sync::Mutex::new(transport),
            detector: parking_lot::Mutex::new(detector),
        });

        let callback = self.make_transcript_callback(Arc::downgrade(&handle));
        handle
            .transport
            .lock()
            .await
            .on_transcript(callback)
            .await?;

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(session_id) {
                let mut transport = handle.transport.lock().await;
                let _ = transport.disconnect().await;
                return Err(StreamingError::DuplicateSession(session_id.to_string()));
            }
            sessions.insert(session_id.to_string(), handle);
        }

        info!(
            session_id = %session_id,
            transport = transport_kind.as_str(),
            "Streaming session started"
        );

        if !self.monitor_running.swap(true, Ordering::SeqCst) {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.monitor_loop().await;
            });
        }

        Ok(())
    }

    /// Run one audio chunk through the session pipeline.
    ///
    /// Buffers the raw chunk, normalizes it, forwards it over the transport
    /// and consults the endpoint detector when a partial transcript exists.
    /// A transport send failure does not abort the session; the chunk is lost
    /// and the fallback path runs instead.
    pub async fn process_audio_chunk(
        &self,
        session_id: &str,
        chunk: &[u8],
    ) -> StreamingResult<ChunkOutcome> {
        let handle = self.session_handle(session_id).await?;

        {
            let mut state = handle.state.write();
            if state.status == SessionStatus::Failed {
                return Err(StreamingError::SessionFailed(session_id.to_string()));
            }
            while state.audio_buffer.len() >= self.config.audio_buffer_chunks {
                state.audio_buffer.pop_front();
            }
            state.audio_buffer.push_back(chunk.to_vec());
        }

        let samples = self.audio_processor.process_chunk(chunk)?;
        let samples = self.audio_processor.apply_noise_reduction(samples);
        let energy = rms_energy(&samples);

        {
            let mut state = handle.state.write();
            let speaking = energy >= self.config.endpoint.energy_threshold;
            state.speaking = speaking;
            if speaking {
                let now = Instant::now();
                state.last_speech = Some(now);
                if state.utterance_start.is_none() {
                    state.utterance_start = Some(now);
                }
            }
        }

        let send_result = {
            let mut transport = handle.transport.lock().await;
            transport.send_audio(chunk).await
        };
        if let Err(err) = send_result {
            warn!(
                session_id = %session_id,
                error = %err,
                "Audio send failed, attempting transport fallback"
            );
            self.attempt_fallback(&handle, true).await;
        }

        let partial = handle.state.read().partial_transcript.clone();
        if !partial.is_empty() {
            let endpointed = handle.detector.lock().detect_endpoint(&samples, &partial);
            let over_limit = handle
                .state
                .read()
                .utterance_start
                .is_some_and(|start| start.elapsed().as_millis() as u64 >= self.config.max_utterance_ms);
            if over_limit {
                debug!(session_id = %session_id, "Utterance hit duration cap, forcing finalize");
            }
            if endpointed || over_limit {
                if let Some(transcript) = finalize_utterance(&self.dispatcher, &handle).await {
                    return Ok(ChunkOutcome {
                        partial_transcript: transcript,
                        is_final: true,
                    });
                }
            }
        }

        Ok(ChunkOutcome {
            partial_transcript: partial,
            is_final: false,
        })
    }

    /// Finalize any pending transcript, tear down the transport and remove
    /// the session. A second stop for the same id reports `SessionNotFound`.
    pub async fn stop_session(&self, session_id: &str) -> StreamingResult<()> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| StreamingError::SessionNotFound(session_id.to_string()))?
        };

        finalize_utterance(&self.dispatcher, &handle).await;

        let mut transport = handle.transport.lock().await;
        if let Err(err) = transport.disconnect().await {
            warn!(session_id = %session_id, error = %err, "Transport teardown failed");
        }

        info!(session_id = %session_id, "Streaming session stopped");
        Ok(())
    }

    /// Point-in-time statistics for one session.
    pub async fn session_stats(&self, session_id: &str) -> StreamingResult<SessionStats> {
        let handle = self.session_handle(session_id).await?;
        let metrics = handle.transport.lock().await.metrics();
        let state = handle.state.read();
        Ok(SessionStats {
            session_id: state.session_id.clone(),
            duration_ms: state.started_at.elapsed().as_millis() as u64,
            transport_kind: state.transport_kind,
            quality: metrics.quality,
            latency_ms: metrics.latency_ms,
            packet_loss: metrics.packet_loss,
            transcript_count: state.final_transcripts.len(),
            buffered_chunks: state.audio_buffer.len(),
        })
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session_handle(&self, session_id: &str) -> StreamingResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StreamingError::SessionNotFound(session_id.to_string()))
    }

    /// Transcript callback installed on every transport.
    ///
    /// Holds only a weak reference to the session so a stopped session's
    /// transport loops cannot keep its state alive.
    fn make_transcript_callback(&self, weak: Weak<SessionHandle>) -> TranscriptCallback {
        let dispatcher = self.dispatcher.clone();
        let partial_interval = Duration::from_millis(self.config.partial_interval_ms);
        Arc::new(move |event| {
            let dispatcher = dispatcher.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let Some(handle) = weak.upgrade() else {
                    return;
                };

                if event.is_final {
                    handle.state.write().partial_transcript = event.partial;
                    finalize_utterance(&dispatcher, &handle).await;
                    return;
                }

                let (session_id, due) = {
                    let mut state = handle.state.write();
                    state.partial_transcript = event.partial.clone();
                    if state.utterance_start.is_none() {
                        state.utterance_start = Some(Instant::now());
                    }
                    let now = Instant::now();
                    let due = state
                        .last_partial_emit
                        .is_none_or(|last| now.duration_since(last) >= partial_interval);
                    if due {
                        state.last_partial_emit = Some(now);
                    }
                    (state.session_id.clone(), due)
                };

                if due {
                    dispatcher
                        .emit_partial(PartialTranscript {
                            session_id,
                            transcript: event.partial,
                            confidence: event.confidence,
                            timestamp_ms: event.timestamp_ms,
                        })
                        .await;
                }
            })
        })
    }

    /// Shared quality-monitoring loop, one per manager while sessions exist.
    async fn monitor_loop(&self) {
        debug!("Quality monitor started");
        loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;

            let handles: Vec<Arc<SessionHandle>> =
                self.sessions.read().await.values().cloned().collect();
            if handles.is_empty() {
                self.monitor_running.store(false, Ordering::SeqCst);
                // A session may have been registered between the snapshot and
                // the flag clear; reclaim the loop if no new monitor spawned.
                if self.sessions.read().await.is_empty()
                    || self.monitor_running.swap(true, Ordering::SeqCst)
                {
                    break;
                }
                continue;
            }

            for handle in handles {
                let metrics = handle.transport.lock().await.metrics();
                let (session_id, previous, failed) = {
                    let state = handle.state.read();
                    (
                        state.session_id.clone(),
                        state.last_quality,
                        state.status == SessionStatus::Failed,
                    )
                };
                if failed {
                    continue;
                }

                if metrics.quality != previous {
                    handle.state.write().last_quality = metrics.quality;
                    info!(
                        session_id = %session_id,
                        from = previous.as_str(),
                        to = metrics.quality.as_str(),
                        latency_ms = metrics.latency_ms,
                        packet_loss = metrics.packet_loss,
                        "Connection quality changed"
                    );
                    self.dispatcher
                        .emit_quality_change(QualityChange {
                            session_id: session_id.clone(),
                            previous,
                            current: metrics.quality,
                            metrics: metrics.clone(),
                        })
                        .await;
                }

                if metrics.quality.is_degraded() {
                    self.attempt_fallback(&handle, false).await;
                } else if handle.state.read().fallback_warned {
                    // Recovery re-arms the once-per-episode warning.
                    handle.state.write().fallback_warned = false;
                }
            }
        }
        debug!("Quality monitor stopped");
    }

    /// Switch a degraded socket session onto the data-channel transport.
    ///
    /// On success the buffered audio is drained into the new transport and
    /// the old one is torn down. With no transport left to try, a quality
    /// trigger only logs; a send failure marks the session as failed and
    /// fires the error callback.
    async fn attempt_fallback(&self, handle: &Arc<SessionHandle>, send_failure: bool) {
        let (session_id, kind, failed) = {
            let state = handle.state.read();
            (
                state.session_id.clone(),
                state.transport_kind,
                state.status == SessionStatus::Failed,
            )
        };
        if failed {
            return;
        }

        let exhausted = kind == TransportKind::WebRtc || !self.config.enable_webrtc_fallback;
        if exhausted {
            if send_failure {
                self.mark_failed(handle, &session_id, "no fallback transport available")
                    .await;
            } else {
                let first_warning = {
                    let mut state = handle.state.write();
                    let first = !state.fallback_warned;
                    state.fallback_warned = true;
                    first
                };
                if first_warning {
                    warn!(
                        session_id = %session_id,
                        transport = kind.as_str(),
                        "Connection degraded with no fallback transport available"
                    );
                }
            }
            return;
        }

        info!(session_id = %session_id, "Falling back from socket to data-channel transport");
        let mut replacement =
            match (self.transport_factory)(TransportKind::WebRtc, &self.config, &session_id) {
                Ok(transport) => transport,
                Err(err) => {
                    self.fallback_failed(handle, &session_id, &err, send_failure).await;
                    return;
                }
            };

        if let Err(err) = replacement.connect().await {
            self.fallback_failed(handle, &session_id, &err, send_failure).await;
            return;
        }

        let callback = self.make_transcript_callback(Arc::downgrade(handle));
        if let Err(err) = replacement.on_transcript(callback).await {
            self.fallback_failed(handle, &session_id, &err, send_failure).await;
            return;
        }

        // Replay what we still hold; stale chunks beyond the buffer are gone.
        let buffered: Vec<Vec<u8>> = handle.state.read().audio_buffer.iter().cloned().collect();
        for chunk in &buffered {
            if let Err(err) = replacement.send_audio(chunk).await {
                warn!(session_id = %session_id, error = %err, "Dropped buffered chunk during fallback");
            }
        }

        let mut old = {
            let mut transport = handle.transport.lock().await;
            std::mem::replace(&mut *transport, replacement)
        };
        if let Err(err) = old.disconnect().await {
            warn!(session_id = %session_id, error = %err, "Old transport teardown failed");
        }

        {
            let mut state = handle.state.write();
            state.transport_kind = TransportKind::WebRtc;
        }
        info!(
            session_id = %session_id,
            replayed_chunks = buffered.len(),
            "Transport fallback complete"
        );
    }

    async fn fallback_failed(
        &self,
        handle: &Arc<SessionHandle>,
        session_id: &str,
        err: &TransportError,
        send_failure: bool,
    ) {
        error!(session_id = %session_id, error = %err, "Transport fallback failed");
        if send_failure {
            self.mark_failed(handle, session_id, &format!("fallback failed: {err}"))
                .await;
        }
    }

    async fn mark_failed(&self, handle: &Arc<SessionHandle>, session_id: &str, reason: &str) {
        {
            let mut state = handle.state.write();
            if state.status == SessionStatus::Failed {
                return;
            }
            state.status = SessionStatus::Failed;
        }
        error!(session_id = %session_id, reason = %reason, "Session failed, transports exhausted");
        self.dispatcher
            .emit_error(SessionError {
                session_id: session_id.to_string(),
                message: format!("transports exhausted: {reason}"),
            })
            .await;
    }
}

/// Copy the pending partial into the final-transcript list, emit the final
/// event and clear per-utterance state. Returns the finalized text, or `None`
/// when there was nothing pending. The session stays open for the next
/// utterance.
async fn finalize_utterance(
    dispatcher: &EventDispatcher,
    handle: &SessionHandle,
) -> Option<String> {
    let (session_id, transcript) = {
        let mut state = handle.state.write();
        let text = state.partial_transcript.trim().to_string();
        if text.is_empty() {
            return None;
        }
        state.final_transcripts.push(text.clone());
        state.partial_transcript.clear();
        state.audio_buffer.clear();
        state.speaking = false;
        state.utterance_start = None;
        state.last_partial_emit = None;
        (state.session_id.clone(), text)
    };

    handle.detector.lock().reset();

    debug!(session_id = %session_id, "Utterance finalized");
    dispatcher
        .emit_final(FinalTranscript {
            session_id,
            transcript: transcript.clone(),
            timestamp_ms: epoch_millis(),
        })
        .await;
    Some(transcript)
}
