//! Error handling - stable, inspectable error kinds

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification, stable across error sources.
///
/// Callers (e.g. a REST layer) map these to their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input: invalid currency code, trust limit below traded balance,
    /// missing or conflicting signer keys.
    Validation,
    /// A payment or path payment exceeds the available balance.
    InsufficientBalance,
    /// Unknown account, transaction or transfer.
    NotFound,
    /// Invariant violation or unmet precondition. A bug, not a user error.
    Internal,
    /// HTTP transport failure.
    Network,
    /// Wire payload could not be encoded or decoded.
    Serialization,
    /// Event stream failure.
    Stream,
    /// The network rejected a submitted transaction.
    Submission,
}

/// Ledger engine error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("transaction rejected: {0}")]
    Submission(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Network(_) => ErrorKind::Network,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Stream(_) => ErrorKind::Stream,
            Error::Submission(_) => ErrorKind::Submission,
        }
    }

    /// Rebuild an error that crossed a shared in-flight operation, where only
    /// its kind and message survive. Transport-layer kinds collapse to
    /// `Stream` since their sources cannot be reconstructed.
    pub(crate) fn from_parts(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::InsufficientBalance => Error::InsufficientBalance(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Internal => Error::Internal(message),
            ErrorKind::Submission => Error::Submission(message),
            ErrorKind::Network | ErrorKind::Serialization | ErrorKind::Stream => {
                Error::Stream(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_from_parts() {
        let err = Error::NotFound("account missing".to_string());
        let replayed = Error::from_parts(err.kind(), err.to_string());
        assert_eq!(replayed.kind(), ErrorKind::NotFound);
        assert_eq!(replayed.to_string(), err.to_string());
    }
}
