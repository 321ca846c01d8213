use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the core. Each variant maps to one error kind the
/// pipeline and its collaborators can raise; classification into retryable
/// vs. terminal is done by [`CoreError::retry_kind`], not by matching
/// strings at call sites.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("provider rate limited")]
    ProviderRateLimited { retry_after: Option<Duration> },

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("invalid input rejected by provider: {0}")]
    ProviderInvalidInput(String),

    #[error("provider request timed out")]
    ProviderTimeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("column '{0}' is absent from this deployment's schema")]
    MissingColumn(String),

    #[error("capacity denied: {0}")]
    CapacityDenied(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("rate limiter store error: {0}")]
    RateLimiter(String),
}

/// How the pipeline should react to a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Retry on a different provider, if one is configured (extract only).
    FallbackProvider,
    /// Not an error the pipeline needs to see at all; caller should back
    /// off and retry the same operation.
    BackOffAndRetry,
    /// Permanent: record the error and apply the attempt-budget policy.
    Terminal,
}

impl CoreError {
    pub fn retry_kind(&self) -> RetryKind {
        match self {
            CoreError::ProviderRateLimited { .. }
            | CoreError::ProviderTransient(_)
            | CoreError::ProviderTimeout => RetryKind::FallbackProvider,
            CoreError::CapacityDenied(_) | CoreError::RateLimited { .. } => {
                RetryKind::BackOffAndRetry
            }
            CoreError::ProviderAuth(_)
            | CoreError::ProviderInvalidInput(_)
            | CoreError::Storage(_)
            | CoreError::Database(_)
            | CoreError::MissingColumn(_)
            | CoreError::RateLimiter(_) => RetryKind::Terminal,
        }
    }
}
