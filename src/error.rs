//! Error types for the agent backend.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Variants line up with the failure kinds in the
/// error-handling design: each is handled at a specific call site rather
/// than bubbled up as an opaque string.
#[derive(Error, Debug)]
pub enum Error {
    /// KV store (Redis) connection or command failure.
    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),

    /// HTTP transport failure (connection, DNS, TLS).
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A non-2xx response from an upstream HTTP API, with the status code.
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Failure returned by the LLM service (malformed output, non-2xx, etc).
    #[error("llm error: {0}")]
    Llm(String),

    /// Requested tool/operation is not present in the registry.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Distributed lock was not acquired (resource already held).
    #[error("lock not acquired: {0}")]
    LockHeld(String),

    /// Tool gateway's circuit breaker is open.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Generic invalid input, caught at a validation boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Catch-all for conditions that don't warrant a dedicated variant.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Error::Upstream { status, message: msg.into() }
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Error::Llm(msg.into())
    }

    pub fn tool_not_found(op_id: impl Into<String>) -> Self {
        Error::ToolNotFound(op_id.into())
    }

    pub fn lock_held(resource: impl Into<String>) -> Self {
        Error::LockHeld(resource.into())
    }

    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Error::CircuitOpen(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether this error represents a transient condition worth retrying
    /// (network blip, timeout, 5xx).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Timeout(_) | Error::Kv(_))
            || matches!(self, Error::Upstream { status, .. } if *status >= 500)
    }
}
