//! Error kinds shared across the certificate factory, patcher, and receiver.

use thiserror::Error;

/// The error kinds a caller needs to distinguish when driving castforge.
#[derive(Debug, Error)]
pub enum CastforgeError {
    /// Mutually exclusive flags, or a required input was not supplied
    /// (e.g. no root and no intermediates given to the server).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key generation, signing, or certificate construction failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// PEM/DER parse failure, protobuf decode failure, JSON parse failure,
    /// or an unexpected payload shape.
    #[error("format error: {0}")]
    Format(String),

    /// Bad protocol version, unexpected namespace at auth time, bad payload
    /// type, or an unsupported hash/signature algorithm.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// File or socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Target bytes not found, replacement length mismatch, or double-patch.
    #[error("patch error: {0}")]
    Patch(String),

    /// Length-targeted root generation failed after the retry budget.
    #[error("search exhausted: {0}")]
    SearchExhausted(String),
}

pub type Result<T> = std::result::Result<T, CastforgeError>;
