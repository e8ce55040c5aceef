use thiserror::Error;

use crate::types::{ContributionId, EventId};

/// Operator-facing misconfiguration. Jobs fail fast on these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("setting {key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("retry schedule must be non-empty and strictly ascending")]
    InvalidRetrySchedule,
}

/// Failures of the relational or key/value store behind a collaborator trait.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("contribution not found: {0}")]
    ContributionNotFound(ContributionId),

    #[error("webhook event not found: {0}")]
    EventNotFound(EventId),

    #[error("payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A provider status query that did not produce an answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider query timed out")]
    Timeout,

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider response could not be parsed: {0}")]
    Malformed(String),
}

/// Endpoint secret could not be recovered for signing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret could not be decrypted: {0}")]
    Decrypt(String),

    #[error("secret could not be encrypted")]
    Encrypt,
}

/// Reasons an HTTP delivery attempt produced no response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("counter store unavailable: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert transport failed: {0}")]
    Transport(String),
}

/// Errors that abort a whole job invocation.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job is misconfigured: {0}")]
    Misconfigured(#[from] ConfigError),

    #[error("job credential rejected")]
    Unauthorized,

    #[error("job trigger rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
