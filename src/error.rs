use thiserror::Error;

/// Top-level failures that end a command or a run.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Authentication failed after {attempts} attempts: {last}")]
    AuthenticationExhausted { attempts: u32, last: AuthError },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures raised by the remote UI surface primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    /// A row reference no longer points at the element it was read from.
    #[error("stale row handle: {0}")]
    StaleHandle(String),

    #[error("timed out after {after_ms}ms waiting for {what}")]
    Timeout { what: String, after_ms: u64 },

    #[error("element not found: {0}")]
    ElementMissing(String),

    /// The driver itself failed (protocol error, closed page, script error).
    #[error("driver error: {0}")]
    Driver(String),
}

impl SurfaceError {
    /// Transient errors are retried by re-scanning within the same pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SurfaceError::StaleHandle(_) | SurfaceError::Timeout { .. } | SurfaceError::ElementMissing(_)
        )
    }
}

/// Failures of the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("one-time token unavailable")]
    TokenUnavailable,

    #[error("authentication timed out")]
    Timeout,

    #[error("surface error during authentication: {0}")]
    Surface(#[from] SurfaceError),
}

impl AuthError {
    /// Rejected credentials are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::InvalidCredentials)
    }
}

/// Failures of the attempt-ledger persistence backend.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
