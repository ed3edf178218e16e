//! Error handling for the ledger node
//!
//! Every fallible operation in the crate returns [`Result`]. Consensus
//! rejections travel through the same type as [`BlockchainError::Consensus`]
//! so validation can short-circuit with `?` while callers still tell an
//! expected rejection apart from a storage failure.

use crate::core::Rejection;
use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error types for ledger operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// A block or transaction broke a consensus rule
    Consensus(Rejection),
    /// Embedded database errors (secondary transaction index)
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Network collaborator errors
    Network(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Invalid address format
    InvalidAddress(String),
    /// Transaction construction errors
    Transaction(String),
    /// Derived cache does not match the index and data files
    CacheCorrupted(String),
    /// The termination signal was raised before a lock could be taken
    Terminated,
}

impl BlockchainError {
    /// Storage failures leave the index and data files in an unknown state,
    /// the node has no safe way to continue after one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BlockchainError::Io(_) | BlockchainError::Database(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            BlockchainError::Consensus(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Consensus(rejection) => write!(f, "Rejected: {rejection}"),
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::CacheCorrupted(msg) => write!(f, "Cache corrupted: {msg}"),
            BlockchainError::Terminated => write!(f, "Node is terminating"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<Rejection> for BlockchainError {
    fn from(rejection: Rejection) -> Self {
        BlockchainError::Consensus(rejection)
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_fatal() {
        let io: BlockchainError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(io.is_fatal());
        assert!(BlockchainError::Database("tree".to_string()).is_fatal());
    }

    #[test]
    fn test_rejections_are_not_fatal() {
        let err: BlockchainError = Rejection::WrongHash.into();
        assert!(!err.is_fatal());
        assert_eq!(err.rejection(), Some(&Rejection::WrongHash));
        assert_eq!(err.to_string(), "Rejected: Wrong hash");
    }

    #[test]
    fn test_terminated_display() {
        assert_eq!(BlockchainError::Terminated.to_string(), "Node is terminating");
        assert!(!BlockchainError::Terminated.is_fatal());
    }
}
