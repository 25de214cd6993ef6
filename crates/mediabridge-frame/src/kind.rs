//! Built-in message kinds carried in the frame header.
//!
//! The kind tells the decoder which payload shape to expect, so a record is
//! never ambiguous between a request, a response and a notification.

/// Host → engine call expecting a response.
pub const REQUEST: u16 = 1;

/// Engine → host settlement of a request.
pub const RESPONSE: u16 = 2;

/// Engine → host unsolicited event scoped to a target.
pub const NOTIFICATION: u16 = 3;

/// Returns a human-readable name for a message kind.
pub fn kind_name(kind: u16) -> &'static str {
    match kind {
        REQUEST => "request",
        RESPONSE => "response",
        NOTIFICATION => "notification",
        _ => "unknown",
    }
}

/// Returns true if the kind is defined by the protocol.
pub fn is_known(kind: u16) -> bool {
    matches!(kind, REQUEST | RESPONSE | NOTIFICATION)
}
