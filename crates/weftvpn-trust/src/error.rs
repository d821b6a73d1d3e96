//! Trust layer errors

use thiserror::Error;

/// Trust layer errors
#[derive(Debug, Error)]
pub enum TrustError {
    /// Certificate could not be parsed
    #[error("Certificate parse error: {0}")]
    CertificateParse(String),

    /// Revocation list could not be parsed
    #[error("Revocation list parse error: {0}")]
    CrlParse(String),

    /// Input was empty or structurally invalid
    #[error("Invalid input format")]
    InvalidFormat,
}

/// Result type for trust operations
pub type TrustResult<T> = Result<T, TrustError>;
