use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the storage and propagation layers.
///
/// Unavailability (store shutting down, record not yet present) is never an
/// error; those paths return `None` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
