//! ============================================================================
//! Error Types - Failure taxonomy for the memory subsystem
//! ============================================================================
//! - StorageError: the store could not be read or written
//! - ServiceError: an external completion / speech call failed
//! - ScoringFailure: importance or fact derivation could not complete
//!   (logged and treated as a zero score, never propagated to the user)
//! ============================================================================

use std::time::Duration;

/// The memory store could not be read or written
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Cannot resolve memory store path: {0}")]
    Path(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Record encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

// redb reports one error type per layer; fold them all into redb::Error so
// `?` works on every store call.
macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(e: $ty) -> Self {
                    StorageError::Database(redb::Error::from(e))
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// An external model or speech service call failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication rejected ({status})")]
    Auth { status: u16 },

    #[error("Rate limited by service")]
    RateLimited,

    #[error("Service API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed service response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Map a non-success HTTP status to the matching variant
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ServiceError::Auth { status },
            429 => ServiceError::RateLimited,
            _ => ServiceError::Api { status, body },
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ServiceError::InvalidResponse(e.to_string())
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

/// Importance / fact derivation could not complete
#[derive(Debug, Clone, thiserror::Error)]
#[error("Scoring failed: {0}")]
pub struct ScoringFailure(pub String);

impl From<ServiceError> for ScoringFailure {
    fn from(e: ServiceError) -> Self {
        ScoringFailure(e.to_string())
    }
}
