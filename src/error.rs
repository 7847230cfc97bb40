//! Error types for the RAIN striped-file engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Status Codes
// =============================================================================

/// Coarse status classes surfaced to callers of the engine.
///
/// Every [`Error`] maps to exactly one of these; the adaptor encodes the
/// class plus the human-readable message into its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Invalid,
    IoError,
    NoSpace,
    PermissionDenied,
    NotFound,
    Exists,
    OperationExpired,
    NotMutable,
    UnsupportedLayout,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Invalid => "invalid",
            StatusCode::IoError => "io-error",
            StatusCode::NoSpace => "no-space",
            StatusCode::PermissionDenied => "permission-denied",
            StatusCode::NotFound => "not-found",
            StatusCode::Exists => "exists",
            StatusCode::OperationExpired => "operation-expired",
            StatusCode::NotMutable => "not-mutable",
            StatusCode::UnsupportedLayout => "unsupported-layout",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Errors that can occur in the RAIN engine.
///
/// Variants carry owned strings so errors can be cloned into async-handler
/// state and re-surfaced when the caller joins in-flight operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid argument or configuration
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Generic I/O failure on a stripe or the engine itself
    #[error("I/O error: {0}")]
    Io(String),

    /// Storage exhausted
    #[error("no space left: {0}")]
    NoSpace(String),

    /// Access denied by the underlying store
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Stripe file or object missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists
    #[error("already exists: {0}")]
    Exists(String),

    /// Operation exceeded its timeout
    #[error("operation expired: {0}")]
    OperationExpired(String),

    /// Mutating operation on a read-only handle
    #[error("not mutable: {0}")]
    NotMutable(String),

    /// Layout id or descriptor the engine cannot drive
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// Stripe header failed validation
    #[error("invalid header on stripe {stripe}: {reason}")]
    HeaderInvalid { stripe: usize, reason: String },

    /// Not enough healthy stripes to satisfy the operation
    #[error("insufficient stripes: have {available}, need {required}")]
    InsufficientStripes { available: usize, required: usize },

    /// A group could not be reconstructed from the surviving blocks
    #[error("recovery failed for group at offset {group_offset}: {reason}")]
    RecoveryFailed { group_offset: u64, reason: String },

    /// Parity computation failed; the handle is sticky-failed until close
    #[error("parity computation failed for group at offset {group_offset}")]
    ParityFailed { group_offset: u64 },
}

impl Error {
    /// Classify this error into its wire status code.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Invalid(_) => StatusCode::Invalid,
            Error::Io(_) => StatusCode::IoError,
            Error::NoSpace(_) => StatusCode::NoSpace,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::Exists(_) => StatusCode::Exists,
            Error::OperationExpired(_) => StatusCode::OperationExpired,
            Error::NotMutable(_) => StatusCode::NotMutable,
            Error::UnsupportedLayout(_) => StatusCode::UnsupportedLayout,
            Error::HeaderInvalid { .. } => StatusCode::IoError,
            Error::InsufficientStripes { .. } => StatusCode::IoError,
            Error::RecoveryFailed { .. } => StatusCode::IoError,
            Error::ParityFailed { .. } => StatusCode::IoError,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        #[cfg(unix)]
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::ENOSPC | libc::EDQUOT => return Error::NoSpace(err.to_string()),
                libc::ETIMEDOUT => return Error::OperationExpired(err.to_string()),
                _ => {}
            }
        }

        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => Error::PermissionDenied(err.to_string()),
            ErrorKind::AlreadyExists => Error::Exists(err.to_string()),
            ErrorKind::TimedOut => Error::OperationExpired(err.to_string()),
            ErrorKind::InvalidInput => Error::Invalid(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
