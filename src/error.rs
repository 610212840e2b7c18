//! Error types for peerchain

use thiserror::Error;

/// Reasons a candidate block or transaction is refused admission.
///
/// Returned to the direct caller of `add_block`/`add_transaction` and never
/// retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid index: expected {expected} got {actual}")]
    InvalidIndex { expected: u64, actual: u64 },

    #[error("Invalid previous hash: expected {expected} got {actual}")]
    InvalidPreviousHash { expected: String, actual: String },

    #[error("Invalid hash: expected {expected} got {actual}")]
    InvalidHash { expected: String, actual: String },

    #[error("Invalid proof-of-work difficulty: measure {measure} must be smaller than {difficulty}")]
    InvalidDifficulty { measure: i64, difficulty: i64 },

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(u64),
}

/// A peer interaction that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Peer {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Peer {url} timed out")]
    Timeout { url: String },

    #[error("Peer {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("Peer {url} sent an undecodable body: {reason}")]
    Decode { url: String, reason: String },

    #[error("Invalid peer url {0}")]
    InvalidUrl(String),
}

impl NetworkError {
    /// The peer url the failure is attributed to, if any.
    pub fn url(&self) -> &str {
        match self {
            NetworkError::Unreachable { url, .. }
            | NetworkError::Timeout { url }
            | NetworkError::Status { url, .. }
            | NetworkError::Decode { url, .. } => url,
            NetworkError::InvalidUrl(url) => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Candidate chain (tip {candidate_tip}) is not longer than local chain (tip {local_tip})")]
    StaleChain { candidate_tip: u64, local_tip: u64 },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::NotFound(_))
    }

    /// HTTP status a peer answers with for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ChainError::NotFound(_) => 404,
            ChainError::Validation(_) | ChainError::StaleChain { .. } | ChainError::Consistency(_) => 409,
            ChainError::Network(NetworkError::InvalidUrl(_)) => 400,
            ChainError::Network(_) => 502,
            _ => 500,
        }
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::DatabaseError(format!("Serialization failed: {}", err))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
