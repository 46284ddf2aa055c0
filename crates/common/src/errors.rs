use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error hierarchy for the generation pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    // === Enqueue-time, surfaced synchronously to the caller ===
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    // === Handled inside the dispatcher, turned into job transitions ===
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("no provider available for content kind '{content_kind}'")]
    NoProviderAvailable { content_kind: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    // === General ===
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Validation errors for enqueue parameters
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Classification of upstream provider failures. Persisted with job rows
/// and tallied per provider for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    InvalidRequest,
    ServerError,
    Timeout,
}

impl ProviderErrorKind {
    /// Transient errors are worth another attempt on a different provider;
    /// invalid requests will fail everywhere.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderErrorKind::InvalidRequest)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::RateLimited => write!(f, "rate_limited"),
            ProviderErrorKind::InvalidRequest => write!(f, "invalid_request"),
            ProviderErrorKind::ServerError => write!(f, "server_error"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for ProviderErrorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limited" => Ok(ProviderErrorKind::RateLimited),
            "invalid_request" => Ok(ProviderErrorKind::InvalidRequest),
            "server_error" => Ok(ProviderErrorKind::ServerError),
            "timeout" => Ok(ProviderErrorKind::Timeout),
            _ => Err(anyhow::anyhow!("unknown provider error kind: {}", s)),
        }
    }
}

/// Failure reported by an upstream provider adapter.
///
/// A job reaped after exceeding its processing timeout is fed through the
/// same retry accounting as a provider `Timeout`.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Map an HTTP status to an error kind.
    pub fn from_status_code(status_code: u16, message: String) -> Self {
        let kind = match status_code {
            429 => ProviderErrorKind::RateLimited,
            408 => ProviderErrorKind::Timeout,
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::ServerError,
        };

        Self {
            kind,
            message,
            status_code: Some(status_code),
        }
    }
}

/// Job/health store failures. Fatal to the current dispatcher tick only;
/// the tick is retried after a short delay.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}
