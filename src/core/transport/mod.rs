//! Streaming transports: the capability trait plus the two concrete variants.

pub mod base;
pub mod socket;
pub mod webrtc;

pub use base::{
    StreamingTransport, TranscriptCallback, TranscriptEvent, TransportError, TransportKind,
};
pub use socket::{SocketTransport, SocketTransportConfig};
pub use webrtc::{RtcTransport, RtcTransportConfig, TurnServerConfig};

pub(crate) use base::epoch_millis;
