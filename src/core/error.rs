//! Error types for the messaging core.

use thiserror::Error;

use super::types::ContactUid;

/// Errors in the mesh crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Keys are the wrong length or identical.
    #[error("invalid key material")]
    InvalidKey,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (short input, invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key or certificate generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// Top-level messaging errors.
#[derive(Debug, Error)]
pub enum CommoError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Some destinations had no usable endpoint.
    #[error("{} contact(s) gone", .0.len())]
    ContactGone(Vec<ContactUid>),

    /// Socket level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// An operation ran past its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Client certificate could not be read.
    #[error("invalid certificate")]
    InvalidCert,

    /// CA certificate could not be read.
    #[error("invalid CA certificate")]
    InvalidCaCert,

    /// Client certificate password is wrong.
    #[error("invalid certificate password")]
    InvalidCertPassword,

    /// CA certificate password is wrong.
    #[error("invalid CA certificate password")]
    InvalidCaCertPassword,

    /// HTTP transfer failure.
    #[error("http error: {0}")]
    Http(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommoError {
    /// Shorthand for [`CommoError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        CommoError::InvalidArgument(msg.into())
    }

    /// The public result code this error maps to.
    pub fn result_code(&self) -> CommoResult {
        match self {
            CommoError::ContactGone(_) => CommoResult::ContactGone,
            CommoError::InvalidCert => CommoResult::InvalidCert,
            CommoError::InvalidCaCert => CommoResult::InvalidCaCert,
            CommoError::InvalidCertPassword => CommoResult::InvalidCertPassword,
            CommoError::InvalidCaCertPassword => CommoResult::InvalidCaCertPassword,
            _ => CommoResult::IllegalArgument,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = CommoError> = std::result::Result<T, E>;

/// Result codes of the public messaging API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommoResult {
    /// The call succeeded.
    Success,
    /// An argument was invalid or the operation is not possible.
    IllegalArgument,
    /// One or more destinations could not be reached.
    ContactGone,
    /// Client certificate could not be read.
    InvalidCert,
    /// CA certificate could not be read.
    InvalidCaCert,
    /// Client certificate password is wrong.
    InvalidCertPassword,
    /// CA certificate password is wrong.
    InvalidCaCertPassword,
}

impl CommoResult {
    /// Collapse a `Result` into a result code.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CommoResult::Success,
            Err(e) => e.result_code(),
        }
    }

    /// True for [`CommoResult::Success`].
    pub fn is_success(self) -> bool {
        self == CommoResult::Success
    }
}
