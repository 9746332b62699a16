//! SHALE - Custom Error Types
//! Defines the error hierarchy for the B+Tree storage engine.

use thiserror::Error;

/// Custom Result type for the Shale engine.
pub type Result<T> = std::result::Result<T, ShaleError>;

/// Error types for the Shale storage engine.
#[derive(Error, Debug)]
pub enum ShaleError {
    /// I/O errors from file operations (read, write, growth, sync).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum or layout mismatch).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// The addressed bucket does not exist.
    #[error("Bucket not found")]
    BucketNotFound,

    /// A bucket with this name already exists.
    #[error("Bucket already exists")]
    BucketExists,

    /// The name refers to a bucket where a value was expected, or the reverse.
    #[error("Incompatible value: name is used by a bucket and a plain entry")]
    IncompatibleValue,

    /// Keys must be non-empty.
    #[error("Key required")]
    KeyRequired,

    /// Key exceeds the maximum key size.
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds the maximum value size.
    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// The transaction hit a fatal error and can no longer be used.
    #[error("Transaction closed after a fatal error")]
    TxClosed,

    /// A stored value does not have the width its typed accessor expects.
    #[error("Invalid value: expected {expected} bytes, found {found}")]
    InvalidValue { expected: usize, found: usize },

    /// A stored integer does not fit the platform integer type.
    #[error("Integer {0} out of range for this platform")]
    IntOutOfRange(i64),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShaleError {
    /// Errors after which a write transaction must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShaleError::Io(_) | ShaleError::Corruption(_))
    }
}

impl From<bincode::Error> for ShaleError {
    fn from(err: bincode::Error) -> Self {
        ShaleError::Serialization(err.to_string())
    }
}
