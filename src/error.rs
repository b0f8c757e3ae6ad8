//! Error types for the keystore.

use thiserror::Error;

/// Main error type for keystore operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("hash mismatch for {what}")]
    HashMismatch { what: String },

    #[error("corruption detected: {reason}")]
    Corruption { reason: String },

    #[error("bad range [{start}, {end}) over {total} chunks")]
    BadRange { start: u32, end: u32, total: u32 },

    #[error("bad argument: {reason}")]
    BadArgument { reason: String },

    #[error("file hash already cached: {hash}")]
    AlreadyCached { hash: String },

    #[error("I/O failure during {operation}: {source}")]
    IoFailure {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn io_failure(operation: impl Into<String>, source: std::io::Error) -> Self {
        Error::IoFailure {
            operation: operation.into(),
            source,
        }
    }

    /// Whether this error corresponds to the wire protocol's NotFound status,
    /// as opposed to the generic Error status.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias for keystore operations.
pub type Result<T> = std::result::Result<T, Error>;
