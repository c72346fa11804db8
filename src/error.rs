//! Error types for taskwarden.

use thiserror::Error;

use crate::task::ExecutionStatus;

/// Exit code used when the supervisor itself fails.
pub const EXIT_CODE_GENERIC_ERROR: i32 = 1;

/// Exit code for invalid or contradictory configuration.
pub const EXIT_CODE_CONFIGURATION_ERROR: i32 = 78;

/// Exit code when the supervisor terminated the child after its timeout.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Exit code when registration was declined due to a concurrency conflict.
pub const EXIT_CODE_CONFLICT: i32 = 75;

/// Exit code when the service denied access (HTTP 403).
pub const EXIT_CODE_PERMISSION_DENIED: i32 = 77;

/// taskwarden error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or contradictory options, fatal at bootstrap
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Secret fetch/parse/extract failed during resolution
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The service declined registration due to the concurrency cap
    #[error("registration conflict: {0}")]
    Conflict(String),

    /// Terminal API error (non-retryable response or exhausted retries)
    #[error("api error: {0}")]
    Api(String),

    /// The service denied access (HTTP 403)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid task state transition
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Failed to spawn the child process
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Broken internal invariant; aborts the supervisor without retries
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => EXIT_CODE_CONFIGURATION_ERROR,
            Error::Resolution(_) => EXIT_CODE_CONFIGURATION_ERROR,
            Error::Conflict(_) => EXIT_CODE_CONFLICT,
            Error::PermissionDenied(_) => EXIT_CODE_PERMISSION_DENIED,
            _ => EXIT_CODE_GENERIC_ERROR,
        }
    }
}

/// Result type alias for taskwarden.
pub type Result<T> = std::result::Result<T, Error>;
