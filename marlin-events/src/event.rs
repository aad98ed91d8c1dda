//! The event value object flowing through driver channels.

use bytes::Bytes;

/// What kind of event this is. `Open` and `Close` are synthesized by the
/// driver on transport attach/detach and carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Open,
    Message,
    Binary,
    Error,
    Close,
}

impl EventKind {
    /// Wire name, used as the SSE `event:` field and in poll responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Message => "message",
            EventKind::Binary => "binary",
            EventKind::Error => "error",
            EventKind::Close => "close",
        }
    }
}

/// One event on a channel. `number` comes from the channel's sequence
/// counter and is strictly monotonic per channel.
#[derive(Debug, Clone)]
pub struct LtEvent {
    pub number: u64,
    pub kind: EventKind,
    pub payload: Bytes,
    /// Opaque application context bound with the channel callback.
    pub sender: u64,
}

impl LtEvent {
    pub fn payload_string(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
