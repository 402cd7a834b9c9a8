//! Error types for DriftSync Core.

use thiserror::Error;

/// Core errors raised while parsing or decoding primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid digest: expected 32 bytes, got {0}")]
    InvalidDigestLength(usize),

    #[error("invalid digest hex: {0}")]
    InvalidDigestHex(#[from] hex::FromHexError),

    #[error("invalid priority value: {0}")]
    InvalidPriority(u8),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
