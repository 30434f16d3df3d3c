//! Common error types for fiscalgate.

use thiserror::Error;

/// Certificate lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    /// No certificate has been stored.
    #[error("certificate not found")]
    NotFound,

    /// The stored certificate is past its validity period.
    #[error("certificate expired at {0}")]
    Expired(String),

    /// Certificate or key material could not be parsed.
    #[error("invalid certificate: {0}")]
    Invalid(String),

    /// The certificate could not be read from or written to storage.
    #[error("certificate storage failure: {0}")]
    Storage(String),
}

/// Mutual-TLS transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MtlsError {
    /// The platform or certificate format cannot be used for mTLS.
    #[error("mTLS not supported: {0}")]
    NotSupported(String),

    /// The transport could not be configured with the certificate.
    #[error("mTLS configuration error: {0}")]
    Configuration(String),

    /// mTLS was required but no certificate is available.
    #[error("mTLS certificate not found")]
    CertificateNotFound,
}

/// Top-level error type for fiscalgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection could not be established (DNS, refused, TLS handshake).
    /// Nothing reached the server.
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not complete within its timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The connection broke after the request was sent; the server may have
    /// processed it.
    #[error("Connection interrupted: {0}")]
    Interrupted(String),

    /// Server answered with a status that has no dedicated variant (5xx, 429, ...).
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// 401: the session is no longer valid.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 403: the principal may not perform this call.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 404: resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// 400/422: the server rejected the payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Certificate lifecycle failure.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// mTLS transport failure.
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// A read could not be served: no connectivity and nothing cached.
    #[error("Offline and no cached data for {0}")]
    OfflineNoCache(String),

    /// The offline queue is full and nothing could be evicted.
    #[error("Offline queue is full ({0} entries)")]
    QueueFull(usize),

    /// Persistent storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Translate a non-success HTTP status and its body into an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 => Error::Unauthorized(message),
            403 => Error::Forbidden(message),
            404 => Error::NotFound(message),
            400 | 422 => Error::Validation(message),
            _ => Error::Http { status, message },
        }
    }

    /// HTTP status carried by this error, if it came from a server response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Unauthorized(_) => Some(401),
            Error::Forbidden(_) => Some(403),
            Error::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Whether the failure is transient and the call may be retried later.
    ///
    /// Connectivity failures, 5xx, 408 and 429 are retryable; everything
    /// else fails the operation immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Interrupted(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Whether a failed mTLS call may be re-issued over the bearer-token channel.
    ///
    /// Only failures raised before the request reached the server qualify,
    /// plus 401/403 (certificate rejected). Timeouts, interrupted connections
    /// and every other status may follow a processed request.
    pub fn allows_token_fallback(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Certificate(_)
                | Error::Mtls(_)
                | Error::Unauthorized(_)
                | Error::Forbidden(_)
        )
    }

    /// Whether the error means the remote service could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Interrupted(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
