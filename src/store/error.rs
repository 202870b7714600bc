//! Message store error types.

use std::fmt;

/// Errors that can occur in a message store.
///
/// [`super::MemoryStore`] never fails; the variants are for stores backed by
/// external storage and plugged in through [`super::MessageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Storage backend error
    Storage(String),
    /// Record failed an integrity check
    Corruption(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Corruption(e) => write!(f, "data corruption: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result type for message store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
