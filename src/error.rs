//! Crate-wide error taxonomy (spec §7) and policy helpers.

use thiserror::Error;

/// The abstract error kind, used by the run controller to pick a retry/fail policy
/// without string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A connect/read timeout or other transport failure talking to an external service.
    TransientNetwork,
    /// The remote service returned `429` or a rate-limit signal.
    RemoteRateLimit,
    /// The LLM gateway's response did not match the expected schema.
    SchemaViolation,
    /// A credential was missing, invalid, or rejected by the remote service.
    AuthFailure,
    /// The loaded configuration was invalid.
    ConfigError,
    /// A checksum or offset invariant was violated (citation or evidence chunk).
    DataIntegrity,
    /// A token or cost budget would be exceeded by the requested operation.
    BudgetExceeded,
    /// The run was cancelled before completion.
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind should be retried locally with backoff (spec §7 policy table).
    pub fn is_locally_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RemoteRateLimit)
    }

    /// Whether this kind is fatal and must be surfaced to the operator without retry.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AuthFailure | Self::ConfigError)
    }
}

/// The crate-wide error type. Every component error converts into this at its boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`ErrorKind::TransientNetwork`].
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// See [`ErrorKind::RemoteRateLimit`].
    #[error("remote rate limit: {0}")]
    RemoteRateLimit(String),

    /// See [`ErrorKind::SchemaViolation`].
    #[error("LLM gateway response violated schema: {0}")]
    SchemaViolation(String),

    /// See [`ErrorKind::AuthFailure`].
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// See [`ErrorKind::ConfigError`].
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// See [`ErrorKind::DataIntegrity`].
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// See [`ErrorKind::BudgetExceeded`].
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// See [`ErrorKind::Cancelled`].
    #[error("run cancelled")]
    Cancelled,

    /// An error originating from filesystem I/O (artifacts, watermark, config).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error serializing or deserializing JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error parsing or serializing TOML configuration.
    #[error("TOML error: {0}")]
    Toml(String),
}

impl Error {
    /// Classify this error into the abstract taxonomy used for retry/fail policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Self::RemoteRateLimit(_) => ErrorKind::RemoteRateLimit,
            Self::SchemaViolation(_) => ErrorKind::SchemaViolation,
            Self::AuthFailure(_) => ErrorKind::AuthFailure,
            Self::ConfigError(_) | Self::Toml(_) => ErrorKind::ConfigError,
            Self::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Self::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Json(_) => ErrorKind::DataIntegrity,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
