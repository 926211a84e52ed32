//! Error types for bisspro-core
//!
//! Per-line problems (malformed store lines, unusable feed entries) are
//! recovered where they occur and only counted. Everything here is what
//! reaches the caller: I/O failures, lookups that found nothing, fetch
//! failures and restarts that did not come back.

use crate::codec::ParseError;
use crate::fetcher::FetchError;
use crate::models::KeyError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bisspro-core
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed store line (only surfaced by single-line entry points)
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Key is not 16 or 32 hex characters
    #[error("Invalid key length: {0} hex chars (expected 16 or 32)")]
    InvalidKeyLength(usize),

    /// Key contains characters that are not hex digits
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Matcher or removal found nothing for the requested identity
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    /// Tuner reported no current service
    #[error("No active service")]
    NoActiveService,

    /// Remote feed could not be fetched
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Store or backup write failed; the previous file is left in place
    #[error("Write failed for {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: bisspro_common::Error,
    },

    /// Store or backup could not be read
    #[error("Read failed for {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Requested snapshot does not exist
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Dependent decoding process did not come back
    #[error("Restart failed: {0}")]
    RestartFailed(String),

    /// Caller stopped waiting before the operation produced a result
    #[error("Operation cancelled")]
    Cancelled,

    /// Background worker panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),

    /// bisspro-common error
    #[error("Common error: {0}")]
    Common(#[from] bisspro_common::Error),
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidLength(len) => Error::InvalidKeyLength(len),
            KeyError::NonHex(text) => Error::InvalidKey(text),
        }
    }
}

/// Convenience Result type using bisspro-core Error
pub type Result<T> = std::result::Result<T, Error>;
