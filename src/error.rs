//! Error types for Weft.

use std::io;

use thiserror::Error;

/// Result type alias for Weft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Weft.
///
/// Only host-side faults surface here: bad arguments and local socket
/// failures. Remote-induced faults (forged, stale or malformed packets)
/// never error — they are dropped, traced, and at most schedule a key
/// exchange.
#[derive(Error, Debug)]
pub enum Error {
    // Argument errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("MTU out of range: {mtu} (allowed {min}..={max})")]
    MtuOutOfRange { mtu: usize, min: usize, max: usize },

    #[error("payload too large: {size} bytes (effective MTU {mtu})")]
    PayloadTooLarge { size: usize, mtu: usize },

    // Socket errors
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    // Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,
}

impl Error {
    /// Check if the error came from the kernel rather than the caller.
    pub fn is_socket(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::BindFailed { .. })
    }
}
