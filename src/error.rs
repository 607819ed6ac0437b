//! Error types for ZakatChain

use thiserror::Error;

/// Coarse classification used by callers to decide between reporting,
/// requeueing, retrying later or halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, bad signature, insufficient funds. Reported, never retried.
    Validation,
    /// Double-spend found when a block is assembled.
    Conflict,
    /// A competing mining run or zakat run holds the resource.
    Concurrency,
    /// The single-writer invariant is broken. Mining halts.
    ConsistencyFault,
    /// Storage, IO or serialization trouble outside the ledger rules.
    Infrastructure,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: String, required: String },
    #[error("Unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("Authentication error: {0}")]
    AuthenticationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Double spend detected: {0}")]
    DoubleSpendDetected(String),
    #[error("Mining is already in progress")]
    AlreadyMining,
    #[error("Mining was cancelled")]
    MiningCancelled,
    #[error("A zakat run is already in progress")]
    ZakatRunInProgress,
    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::InvalidTransaction(_)
            | ChainError::InvalidSignature(_)
            | ChainError::InvalidAmount(_)
            | ChainError::InsufficientFunds { .. }
            | ChainError::UnknownWallet(_)
            | ChainError::AuthenticationError(_)
            | ChainError::NotFound(_)
            | ChainError::CryptoError(_) => ErrorClass::Validation,
            ChainError::DoubleSpendDetected(_) => ErrorClass::Conflict,
            ChainError::AlreadyMining
            | ChainError::MiningCancelled
            | ChainError::ZakatRunInProgress => ErrorClass::Concurrency,
            ChainError::ConsistencyFault(_) => ErrorClass::ConsistencyFault,
            ChainError::DatabaseError(_)
            | ChainError::IoError(_)
            | ChainError::SerializationError(_)
            | ChainError::ConfigError(_) => ErrorClass::Infrastructure,
        }
    }

    /// Structural faults can never become valid later, so the mempool drops
    /// them instead of requeueing.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidSignature(_)
                | ChainError::InvalidAmount(_)
                | ChainError::InvalidTransaction(_)
                | ChainError::CryptoError(_)
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
