//! Backend error types

use std::fmt;

use crate::session::EngineError;
use crate::store::StoreError;

/// Errors returned by [`super::Backend`] implementations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Message store failure
    Store(StoreError),
    /// A session engine refused the operation
    Engine(EngineError),
    /// Implementation specific failure
    Internal(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Store(e) => write!(f, "Store error: {}", e),
            BackendError::Engine(e) => write!(f, "Engine error: {}", e),
            BackendError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Store(e) => Some(e),
            BackendError::Engine(e) => Some(e),
            BackendError::Internal(_) => None,
        }
    }
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        BackendError::Store(e)
    }
}

impl From<EngineError> for BackendError {
    fn from(e: EngineError) -> Self {
        BackendError::Engine(e)
    }
}

/// Backend result type
pub type BackendResult<T> = Result<T, BackendError>;
