//! Error types for the gateway

use thiserror::Error;
use tower::BoxError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GateError>;

/// Main error type for the gateway services
#[derive(Debug, Error)]
pub enum GateError {
    /// Cache storage error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The handle factory failed to build a client
    #[error("Handle construction failed: {source}")]
    HandleConstruction {
        #[source]
        source: BoxError,
    },

    /// A remote operation failed permanently; the cause is kept as-is
    #[error(transparent)]
    Operation(BoxError),

    /// Transient failures persisted past the retry bound
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: BoxError,
    },
}

impl GateError {
    /// The underlying operation error, if this error came from a remote call.
    pub fn operation_cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            GateError::Operation(e) => Some(e.as_ref()),
            GateError::RetryExhausted { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Wraps a factory failure, keeping the cause downcastable.
    pub fn handle_construction(cause: impl Into<BoxError>) -> Self {
        GateError::HandleConstruction {
            source: cause.into(),
        }
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, GateError::RetryExhausted { .. })
    }
}

/// Structured failure of a call against the remote data API.
///
/// Operations handed to the retry loop may return this directly (or wrap it
/// as the `source()` of their own error) so the classifier can decide on the
/// variant instead of the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Could not establish a connection
    #[error("Connection failed: {message}")]
    Connect { message: String },

    /// Connect, read or write timed out
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// Peer reset the connection mid-request
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Non-success HTTP status
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// Credentials rejected
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Request rejected before it reached the API
    #[error("Invalid request: {message}")]
    Validation { message: String },
}

impl ApiError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Failure of a retried operation.
///
/// `Permanent` carries the original error untouched; `Exhausted` is only
/// produced once the retry bound was reached on transient failures and keeps
/// the last cause for inspection.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error(transparent)]
    Permanent(E),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Total number of times the operation ran.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Permanent(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl<E> From<RetryError<E>> for GateError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Permanent(e) => GateError::Operation(Box::new(e)),
            RetryError::Exhausted { attempts, last } => GateError::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
        }
    }
}
