//! Client error types

use std::fmt;

use crate::protocol::{DecodeError, EncodeError, ProtocolError};
use crate::session::EngineError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by [`super::Client`] operations, futures and callbacks
///
/// `Clone` so that one connection failure can resolve every outstanding
/// future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A connect is already pending or the client is connected
    AlreadyConnecting,
    /// Operation requires an established connection
    NotConnected,
    /// Empty client id with a persistent session
    MissingClientId,
    InvalidTopic(&'static str),
    InvalidUrl(String),
    /// Dial or socket failure
    Transport(String),
    /// Malformed traffic from the broker
    Protocol(ProtocolError),
    /// Connection ended before the operation was acknowledged
    ConnectionLost,
    /// The operation was abandoned without a result
    Canceled,
    Engine(EngineError),
    Store(StoreError),
    /// `wait_timeout` elapsed, or no CONNACK within `connect_timeout`
    Timeout,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::AlreadyConnecting => write!(f, "client is already connecting"),
            ClientError::NotConnected => write!(f, "client is not connected"),
            ClientError::MissingClientId => {
                write!(f, "client id required for a persistent session")
            }
            ClientError::InvalidTopic(reason) => write!(f, "invalid topic: {}", reason),
            ClientError::InvalidUrl(url) => write!(f, "invalid url: {}", url),
            ClientError::Transport(e) => write!(f, "transport error: {}", e),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
            ClientError::ConnectionLost => write!(f, "connection lost"),
            ClientError::Canceled => write!(f, "operation canceled"),
            ClientError::Engine(e) => write!(f, "session error: {}", e),
            ClientError::Store(e) => write!(f, "message store error: {}", e),
            ClientError::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidUrl(url) => ClientError::InvalidUrl(url),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Protocol(e.into())
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Protocol(e.into())
    }
}

impl From<EngineError> for ClientError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotEstablished | EngineError::Closed => ClientError::NotConnected,
            other => ClientError::Engine(other),
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Store(e)
    }
}
