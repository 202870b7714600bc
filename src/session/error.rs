//! Session engine error types

use std::fmt;

use crate::store::StoreError;

/// Errors raised by [`super::SessionEngine`]
///
/// Every variant except `PacketIdsExhausted` and `NotEstablished` means the
/// connection has to be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Packet not allowed in the current state or direction
    ProtocolViolation(&'static str),
    /// Nothing received within the keep-alive tolerance
    KeepAliveTimeout,
    /// PINGRESP not seen within one keep-alive interval
    PingTimeout,
    /// Every packet identifier is waiting for an acknowledgment
    PacketIdsExhausted,
    /// Operation requires an established session
    NotEstablished,
    /// Engine already closed
    Closed,
    /// Message store failure
    Store(StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::PingTimeout => write!(f, "ping response timeout"),
            Self::PacketIdsExhausted => write!(f, "no free packet identifiers"),
            Self::NotEstablished => write!(f, "session not established"),
            Self::Closed => write!(f, "session closed"),
            Self::Store(e) => write!(f, "message store: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
