//! Real-time voice streaming transport subsystem.
//!
//! A [`StreamingManager`](core::StreamingManager) accepts live audio per
//! session, forwards it over a negotiable transport (duplex WebSocket or a
//! peer-to-peer data channel), consumes incremental recognition results,
//! decides when an utterance is complete, and reacts to measured connection
//! degradation by falling back to the alternate transport.

pub mod core;

pub use self::core::*;
