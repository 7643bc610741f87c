use std::time::Duration;

/// Core error type for the bot runtime.
///
/// Adapter crates map their specific errors (store driver, chat API client) into this
/// type so the resilience layer can classify failures consistently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Bad command arguments; answered to the user, never retried.
    #[error("{0}")]
    Validation(String),

    /// The remote API refused the action. Never retried.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The remote API is throttling us.
    #[error("rate limited (retry after {retry_after:?}): {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Network or store blip; retried with backoff and tracked by circuit breakers.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// An explicit transaction read data that changed before it committed. The
    /// transaction was rolled back and may be run again.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected the operation. Busy or locked stores map to `Transient`.
    #[error("store error: {0}")]
    Store(String),

    /// Startup could not complete (e.g. store unreachable).
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote API rejected the request (bad request, missing message).
    #[error("external error: {0}")]
    External(String),
}

/// How the retry loop should treat a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited(Option<Duration>),
    PermissionDenied,
    NonRetryable,
    Retryable,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            Error::RateLimited { retry_after, .. } => FailureClass::RateLimited(*retry_after),
            Error::Permission(_) => FailureClass::PermissionDenied,
            Error::CircuitOpen(_)
            | Error::Conflict(_)
            | Error::Validation(_)
            | Error::Config(_)
            | Error::Init(_)
            | Error::Json(_)
            | Error::Store(_)
            | Error::External(_) => FailureClass::NonRetryable,
            Error::Transient(_) | Error::Io(_) => FailureClass::Retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
