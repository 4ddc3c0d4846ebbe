//! Streaming session orchestration.
//!
//! The [`StreamingManager`] owns all active sessions, runs the per-chunk
//! pipeline (buffer, normalize, forward, endpoint check, finalize), monitors
//! connection quality once per second, and falls a degraded socket session
//! back onto the data-channel transport.

pub mod callbacks;
pub mod config;
pub mod errors;
pub mod manager;
pub mod session;


pub use callbacks::{
    ErrorCallback, EventDispatcher, FinalCallback, FinalTranscript, PartialCallback,
    PartialTranscript, QualityCallback, QualityChange, SessionError,
};
pub use config::StreamingConfig;
pub use errors::{StreamingError, StreamingResult};
pub use manager::{DetectorFactory, StreamingManager, TransportFactory};
pub use session::{ChunkOutcome, SessionStats, SessionStatus};
