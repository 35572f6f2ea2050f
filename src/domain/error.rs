//! Error taxonomy for the relayer.
//!
//! Ledger and dispatch failures are closed enums so that the retry logic in
//! the dispatch queue matches on variants, never on message text.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Application-wide error type surfaced by services and HTTP handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Admission denied: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request validation failures (HTTP 400)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("unable to decode transaction")]
    UndecodableCall,

    /// Business-rule rejection produced by the transfer validator
    #[error("{0}")]
    Rejected(String),
}

/// Per-address admission control failures (HTTP 429)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("processing concurrent transaction")]
    ConcurrentRequest,

    #[error("Grace period did not pass for this address")]
    GracePeriod { retry_after: DateTime<Utc> },
}

/// Errors reported by the ledger client.
///
/// This is the closed set the dispatch queue classifies on; see
/// [`BlockchainError::classify`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by node: {0}")]
    RateLimited(String),

    #[error("Invalid node response: {0}")]
    InvalidResponse(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    /// Permanent rejection. `accepted` is true when the node confirmed it had
    /// already taken the transaction into its pool, i.e. the nonce is spent.
    #[error("Transaction rejected: {reason}")]
    Rejected { reason: String, accepted: bool },
}

/// Retry classification of a broadcast failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    NonceConflict,
    Permanent { accepted: bool },
}

impl BlockchainError {
    #[must_use]
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::InvalidResponse(_) => {
                FailureClass::Transient
            }
            Self::NonceConflict(_) => FailureClass::NonceConflict,
            Self::Rejected { accepted, .. } => FailureClass::Permanent {
                accepted: *accepted,
            },
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.classify() == FailureClass::Transient
    }
}

/// Malformed input handed to the signer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("destination is not a valid call target: {0}")]
    InvalidDestination(String),

    #[error("invalid transaction field: {0}")]
    InvalidField(String),

    #[error("signature backend failed: {0}")]
    Backend(String),
}

/// Terminal failures of a dispatch job and queue lifecycle errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch queue failed to start: {0}")]
    Startup(String),

    #[error("Dispatch queue is not running")]
    QueueNotRunning,

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Broadcast failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Nonce conflict could not be resolved: {0}")]
    NonceConflict(String),

    #[error("Dispatch worker terminated before the job completed")]
    WorkerGone,
}

/// Grace-period store persistence errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Startup configuration problems
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}
