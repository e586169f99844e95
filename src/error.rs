//! Error taxonomy (§7, §10.3).
//!
//! Parse and send errors are local to the node core and are never
//! propagated upward (§7, "Propagation policy") -- this enum exists so that
//! internal call sites can use `?` instead of matching on booleans, and so
//! that [`crate::stats::Stats`] can count drops by reason.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Malformed input, an unterminated container, or a non-ASCII-digit
    /// length prefix (§4.2).
    InvalidBencode,
    /// Encode ran out of caller-supplied buffer capacity (§4.2).
    BufferTooSmall,
    /// A required field for the message's type was absent (§4.3, §4.7 step 3).
    MissingField(&'static str),
    /// The `y`/`q`/reply-key combination did not match any of the twelve
    /// known shapes (§4.3).
    UnknownMessageType,
    /// A compact node or peer list was not a multiple of its element size.
    MalformedCompactList,
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::InvalidBencode => write!(f, "invalid bencode"),
            DhtError::BufferTooSmall => write!(f, "encode buffer too small"),
            DhtError::MissingField(name) => write!(f, "missing required field: {}", name),
            DhtError::UnknownMessageType => write!(f, "unrecognised message type"),
            DhtError::MalformedCompactList => write!(f, "malformed compact node/peer list"),
        }
    }
}

impl std::error::Error for DhtError {}
