//! Error types for Relaygate

use thiserror::Error;

use crate::types::ServerKind;

/// Result type alias using Relaygate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Relaygate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Vault envelope could not be parsed.
    #[error("Malformed envelope: {0}")]
    Format(String),

    /// Vault envelope parsed but did not decrypt.
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Connection token not found")]
    TokenNotFound,

    #[error("Connection token expired")]
    TokenExpired,

    #[error("Server is a {actual} target, expected {expected}")]
    ProfileKindMismatch {
        expected: ServerKind,
        actual: ServerKind,
    },

    #[error("Credentials missing: {0}")]
    CredentialMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}
