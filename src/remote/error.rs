use std::time::Duration;
use thiserror::Error;

/// How the sync engine reacts to a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried in place after a delay; invisible to the caller if a retry succeeds.
    Transient,
    /// The caller resets its cursor or token (and re-creates a missing zone),
    /// then restarts the fetch from scratch.
    Structural,
    /// The payload is resubmitted in fixed-size chunks.
    PayloadTooLarge,
    /// Propagated; the run fails.
    Fatal,
}

/// Errors reported by a remote sync provider.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, DNS or TLS failure
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// No response within the request timeout
    #[error("Request timed out")]
    Timeout,
    /// The provider asked us to slow down
    #[error("Rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },
    /// 5xx other than 503
    #[error("Remote service unavailable: status {status}")]
    ServiceUnavailable {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// The zone is being modified by another client
    #[error("Zone busy")]
    ZoneBusy { retry_after: Option<Duration> },
    #[error("Zone not found")]
    ZoneNotFound,
    #[error("Change token expired")]
    ChangeTokenExpired,
    /// Request carried too many items
    #[error("Request limit exceeded")]
    LimitExceeded,
    #[error("Not authorized by remote")]
    Unauthorized,
    /// The user removed the whole zone from another device
    #[error("User deleted the zone")]
    UserDeletedZone,
    /// Any other non-2xx response
    #[error("HTTP error: status {status}: {message}")]
    Http { status: u16, message: String },
    /// Response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Interrupted by cancellation
    #[error("Canceled")]
    Canceled,
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_)
            | RemoteError::Timeout
            | RemoteError::RateLimited { .. }
            | RemoteError::ServiceUnavailable { .. }
            | RemoteError::ZoneBusy { .. } => ErrorClass::Transient,
            RemoteError::ZoneNotFound | RemoteError::ChangeTokenExpired => ErrorClass::Structural,
            RemoteError::LimitExceeded => ErrorClass::PayloadTooLarge,
            RemoteError::Unauthorized
            | RemoteError::UserDeletedZone
            | RemoteError::Http { .. }
            | RemoteError::Decode(_)
            | RemoteError::ResponseTooLarge
            | RemoteError::Canceled => ErrorClass::Fatal,
        }
    }

    /// Delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after }
            | RemoteError::ServiceUnavailable { retry_after, .. }
            | RemoteError::ZoneBusy { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;
